// Copyright 2023 The AppOps Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Current wall time in ms since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Renders a millisecond span the way the classic dump output does:
/// `+1d2h3m4s5ms`, with zero units dropped.
pub fn format_duration(ms: i64) -> String {
    if ms <= 0 {
        return "0".to_owned();
    }
    let mut remaining = ms;
    let days = remaining / 86_400_000;
    remaining %= 86_400_000;
    let hours = remaining / 3_600_000;
    remaining %= 3_600_000;
    let minutes = remaining / 60_000;
    remaining %= 60_000;
    let seconds = remaining / 1_000;
    let millis = remaining % 1_000;

    let mut out = String::from("+");
    let mut started = false;
    for (value, unit) in [
        (days, "d"),
        (hours, "h"),
        (minutes, "m"),
        (seconds, "s"),
        (millis, "ms"),
    ] {
        if value > 0 || (unit == "ms" && !started) {
            out.push_str(&format!("{value}{unit}"));
            started = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0, "0")]
    #[test_case(-5, "0")]
    #[test_case(7, "+7ms")]
    #[test_case(1_000, "+1s")]
    #[test_case(61_000, "+1m1s")]
    #[test_case(3_600_000, "+1h")]
    #[test_case(90_061_001, "+1d1h1m1s1ms")]
    #[test_case(232_639, "+3m52s639ms")]
    fn test_format_duration(ms: i64, expected: &str) {
        assert_eq!(format_duration(ms), expected);
    }
}
