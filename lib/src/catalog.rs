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

//! Static catalog of application operations.
//!
//! Every sensitive action an application can perform is identified by an
//! [`OpCode`]. The catalog is a frozen table: for each code it records the
//! default mode, the switch code under which policy is evaluated, whether the
//! op participates in bulk resets, whether privileged system packages may
//! bypass user restrictions, and the platform permission the op maps to, if
//! any.
//!
//! Policy is always read and written under switch codes. Related ops share a
//! switch (all location ops switch on `COARSE_LOCATION`, the SMS family on
//! `READ_SMS`/`WRITE_SMS`/`RECEIVE_SMS`), so toggling one toggles the group.
//! Accounting stays per real code.

use std::fmt;

use thiserror::Error;

/// Number of defined operation codes. Codes are dense in `[0, NUM_OPS)`.
pub const NUM_OPS: usize = 62;

/// An operation code out of the catalog's range.
#[derive(Debug, Error)]
#[error("unknown operation code {code}")]
pub struct InvalidOpError {
    pub code: i32,
}

/// Authorization decision for an operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// The caller may proceed.
    Allowed,
    /// The caller must silently drop the action and pretend it succeeded.
    Ignored,
    /// The caller should fail loudly.
    Errored,
    /// Fall through to the catalog's default for the op.
    Default,
}

impl Mode {
    /// Wire representation used by the snapshot format.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Allowed => 0,
            Self::Ignored => 1,
            Self::Errored => 2,
            Self::Default => 3,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Allowed),
            1 => Some(Self::Ignored),
            2 => Some(Self::Errored),
            3 => Some(Self::Default),
            _ => None,
        }
    }

    /// Parses the shell spelling of a mode: one of `allow`, `ignore`, `deny`,
    /// `default`, or a raw integer.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allowed),
            "ignore" => Some(Self::Ignored),
            "deny" => Some(Self::Errored),
            "default" => Some(Self::Default),
            _ => s.parse().ok().and_then(Self::from_raw),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Allowed => "allow",
            Self::Ignored => "ignore",
            Self::Errored => "deny",
            Self::Default => "default",
        };
        write!(f, "{name}")
    }
}

/// Identifier of a sensitive application operation.
///
/// Only codes in `[0, NUM_OPS)` exist; construction through
/// [`OpCode::from_raw`] validates the range so the accessors below never
/// fail.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OpCode(u8);

impl OpCode {
    pub const COARSE_LOCATION: Self = Self(0);
    pub const FINE_LOCATION: Self = Self(1);
    pub const GPS: Self = Self(2);
    pub const VIBRATE: Self = Self(3);
    pub const READ_CONTACTS: Self = Self(4);
    pub const WRITE_CONTACTS: Self = Self(5);
    pub const READ_CALL_LOG: Self = Self(6);
    pub const WRITE_CALL_LOG: Self = Self(7);
    pub const READ_CALENDAR: Self = Self(8);
    pub const WRITE_CALENDAR: Self = Self(9);
    pub const WIFI_SCAN: Self = Self(10);
    pub const POST_NOTIFICATION: Self = Self(11);
    pub const NEIGHBORING_CELLS: Self = Self(12);
    pub const CALL_PHONE: Self = Self(13);
    pub const READ_SMS: Self = Self(14);
    pub const WRITE_SMS: Self = Self(15);
    pub const RECEIVE_SMS: Self = Self(16);
    pub const RECEIVE_EMERGENCY_SMS: Self = Self(17);
    pub const RECEIVE_MMS: Self = Self(18);
    pub const RECEIVE_WAP_PUSH: Self = Self(19);
    pub const SEND_SMS: Self = Self(20);
    pub const READ_ICC_SMS: Self = Self(21);
    pub const WRITE_ICC_SMS: Self = Self(22);
    pub const WRITE_SETTINGS: Self = Self(23);
    pub const SYSTEM_ALERT_WINDOW: Self = Self(24);
    pub const ACCESS_NOTIFICATIONS: Self = Self(25);
    pub const CAMERA: Self = Self(26);
    pub const RECORD_AUDIO: Self = Self(27);
    pub const PLAY_AUDIO: Self = Self(28);
    pub const READ_CLIPBOARD: Self = Self(29);
    pub const WRITE_CLIPBOARD: Self = Self(30);
    pub const TAKE_MEDIA_BUTTONS: Self = Self(31);
    pub const TAKE_AUDIO_FOCUS: Self = Self(32);
    pub const AUDIO_MASTER_VOLUME: Self = Self(33);
    pub const AUDIO_VOICE_VOLUME: Self = Self(34);
    pub const AUDIO_RING_VOLUME: Self = Self(35);
    pub const AUDIO_MEDIA_VOLUME: Self = Self(36);
    pub const AUDIO_ALARM_VOLUME: Self = Self(37);
    pub const AUDIO_NOTIFICATION_VOLUME: Self = Self(38);
    pub const AUDIO_BLUETOOTH_VOLUME: Self = Self(39);
    pub const WAKE_LOCK: Self = Self(40);
    pub const MONITOR_LOCATION: Self = Self(41);
    pub const MONITOR_HIGH_POWER_LOCATION: Self = Self(42);
    pub const GET_USAGE_STATS: Self = Self(43);
    pub const MUTE_MICROPHONE: Self = Self(44);
    pub const TOAST_WINDOW: Self = Self(45);
    pub const PROJECT_MEDIA: Self = Self(46);
    pub const ACTIVATE_VPN: Self = Self(47);
    pub const WRITE_WALLPAPER: Self = Self(48);
    pub const ASSIST_STRUCTURE: Self = Self(49);
    pub const ASSIST_SCREENSHOT: Self = Self(50);
    pub const READ_PHONE_STATE: Self = Self(51);
    pub const ADD_VOICEMAIL: Self = Self(52);
    pub const USE_SIP: Self = Self(53);
    pub const PROCESS_OUTGOING_CALLS: Self = Self(54);
    pub const USE_FINGERPRINT: Self = Self(55);
    pub const BODY_SENSORS: Self = Self(56);
    pub const READ_CELL_BROADCASTS: Self = Self(57);
    pub const MOCK_LOCATION: Self = Self(58);
    pub const READ_EXTERNAL_STORAGE: Self = Self(59);
    pub const WRITE_EXTERNAL_STORAGE: Self = Self(60);
    pub const TURN_SCREEN_ON: Self = Self(61);

    /// Validates a raw integer code against the catalog range.
    pub fn from_raw(code: i32) -> Result<Self, InvalidOpError> {
        if (0..NUM_OPS as i32).contains(&code) {
            Ok(Self(code as u8))
        } else {
            Err(InvalidOpError { code })
        }
    }

    pub fn as_raw(self) -> i32 {
        i32::from(self.0)
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }

    /// All defined codes in ascending order.
    pub fn all() -> impl ExactSizeIterator<Item = Self> {
        (0..NUM_OPS as u8).map(Self)
    }

    fn info(self) -> &'static OpInfo {
        &OPS[self.index()]
    }

    /// Catalog name, e.g. `COARSE_LOCATION`.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// The code policy for this op is actually stored under.
    pub fn switch_code(self) -> Self {
        self.info().switch
    }

    /// Mode used when no explicit mode has been recorded.
    pub fn default_mode(self) -> Mode {
        self.info().default_mode
    }

    /// Whether a bulk reset may return this op to its default mode.
    pub fn is_resettable(self) -> bool {
        self.info().resettable
    }

    /// Whether privileged system packages are exempt from user restrictions
    /// on this op.
    pub fn allows_system_bypass(self) -> bool {
        self.info().system_bypass
    }

    /// Platform permission guarding the same action, if there is one.
    pub fn permission(self) -> Option<&'static str> {
        self.info().permission
    }

    /// Named user restriction (`no_sms`, ...) that forbids this op when set,
    /// if the op participates in one.
    pub fn user_restriction(self) -> Option<&'static str> {
        self.info().user_restriction
    }

    /// Looks up a code by catalog name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().find(|op| op.name() == name)
    }

    /// Maps a platform permission to the op accounting for it.
    pub fn for_permission(permission: &str) -> Option<Self> {
        Self::all().find(|op| op.permission() == Some(permission))
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode({})", self.name())
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

struct OpInfo {
    name: &'static str,
    switch: OpCode,
    default_mode: Mode,
    resettable: bool,
    system_bypass: bool,
    permission: Option<&'static str>,
    user_restriction: Option<&'static str>,
}

const fn op(name: &'static str, switch: OpCode, default_mode: Mode) -> OpInfo {
    OpInfo {
        name,
        switch,
        default_mode,
        resettable: true,
        system_bypass: false,
        permission: None,
        user_restriction: None,
    }
}

impl OpInfo {
    const fn perm(mut self, permission: &'static str) -> Self {
        self.permission = Some(permission);
        self
    }

    const fn no_reset(mut self) -> Self {
        self.resettable = false;
        self
    }

    const fn system_bypass(mut self) -> Self {
        self.system_bypass = true;
        self
    }

    const fn restriction(mut self, name: &'static str) -> Self {
        self.user_restriction = Some(name);
        self
    }
}

/// The table index of each entry is its op code; a unit test pins the
/// correspondence with the named constants.
static OPS: [OpInfo; NUM_OPS] = [
    op("COARSE_LOCATION", OpCode::COARSE_LOCATION, Mode::Allowed)
        .perm("android.permission.ACCESS_COARSE_LOCATION")
        .restriction("no_share_location"),
    op("FINE_LOCATION", OpCode::COARSE_LOCATION, Mode::Allowed)
        .perm("android.permission.ACCESS_FINE_LOCATION")
        .restriction("no_share_location"),
    op("GPS", OpCode::COARSE_LOCATION, Mode::Allowed).restriction("no_share_location"),
    op("VIBRATE", OpCode::VIBRATE, Mode::Allowed).perm("android.permission.VIBRATE"),
    op("READ_CONTACTS", OpCode::READ_CONTACTS, Mode::Allowed)
        .perm("android.permission.READ_CONTACTS"),
    op("WRITE_CONTACTS", OpCode::WRITE_CONTACTS, Mode::Allowed)
        .perm("android.permission.WRITE_CONTACTS"),
    op("READ_CALL_LOG", OpCode::READ_CALL_LOG, Mode::Allowed)
        .perm("android.permission.READ_CALL_LOG"),
    op("WRITE_CALL_LOG", OpCode::WRITE_CALL_LOG, Mode::Allowed)
        .perm("android.permission.WRITE_CALL_LOG"),
    op("READ_CALENDAR", OpCode::READ_CALENDAR, Mode::Allowed)
        .perm("android.permission.READ_CALENDAR"),
    op("WRITE_CALENDAR", OpCode::WRITE_CALENDAR, Mode::Allowed)
        .perm("android.permission.WRITE_CALENDAR"),
    op("WIFI_SCAN", OpCode::COARSE_LOCATION, Mode::Allowed)
        .perm("android.permission.ACCESS_WIFI_STATE")
        .restriction("no_share_location"),
    op("POST_NOTIFICATION", OpCode::POST_NOTIFICATION, Mode::Allowed),
    op("NEIGHBORING_CELLS", OpCode::COARSE_LOCATION, Mode::Allowed)
        .restriction("no_share_location"),
    op("CALL_PHONE", OpCode::CALL_PHONE, Mode::Allowed).perm("android.permission.CALL_PHONE"),
    op("READ_SMS", OpCode::READ_SMS, Mode::Allowed)
        .perm("android.permission.READ_SMS")
        .restriction("no_sms"),
    op("WRITE_SMS", OpCode::WRITE_SMS, Mode::Ignored)
        .no_reset()
        .restriction("no_sms"),
    op("RECEIVE_SMS", OpCode::RECEIVE_SMS, Mode::Allowed)
        .perm("android.permission.RECEIVE_SMS")
        .restriction("no_sms"),
    op("RECEIVE_EMERGENCY_SMS", OpCode::RECEIVE_SMS, Mode::Allowed)
        .perm("android.permission.RECEIVE_EMERGENCY_BROADCAST"),
    op("RECEIVE_MMS", OpCode::RECEIVE_SMS, Mode::Allowed)
        .perm("android.permission.RECEIVE_MMS")
        .restriction("no_sms"),
    op("RECEIVE_WAP_PUSH", OpCode::RECEIVE_SMS, Mode::Allowed)
        .perm("android.permission.RECEIVE_WAP_PUSH")
        .restriction("no_sms"),
    op("SEND_SMS", OpCode::SEND_SMS, Mode::Allowed)
        .perm("android.permission.SEND_SMS")
        .restriction("no_sms"),
    op("READ_ICC_SMS", OpCode::READ_SMS, Mode::Allowed)
        .perm("android.permission.READ_SMS")
        .restriction("no_sms"),
    op("WRITE_ICC_SMS", OpCode::WRITE_SMS, Mode::Allowed).restriction("no_sms"),
    op("WRITE_SETTINGS", OpCode::WRITE_SETTINGS, Mode::Default)
        .perm("android.permission.WRITE_SETTINGS"),
    op("SYSTEM_ALERT_WINDOW", OpCode::SYSTEM_ALERT_WINDOW, Mode::Default)
        .perm("android.permission.SYSTEM_ALERT_WINDOW")
        .system_bypass()
        .restriction("no_create_windows"),
    op("ACCESS_NOTIFICATIONS", OpCode::ACCESS_NOTIFICATIONS, Mode::Allowed)
        .perm("android.permission.ACCESS_NOTIFICATIONS"),
    op("CAMERA", OpCode::CAMERA, Mode::Allowed).perm("android.permission.CAMERA"),
    op("RECORD_AUDIO", OpCode::RECORD_AUDIO, Mode::Allowed)
        .perm("android.permission.RECORD_AUDIO"),
    op("PLAY_AUDIO", OpCode::PLAY_AUDIO, Mode::Allowed),
    op("READ_CLIPBOARD", OpCode::READ_CLIPBOARD, Mode::Allowed),
    op("WRITE_CLIPBOARD", OpCode::WRITE_CLIPBOARD, Mode::Allowed),
    op("TAKE_MEDIA_BUTTONS", OpCode::TAKE_MEDIA_BUTTONS, Mode::Allowed),
    op("TAKE_AUDIO_FOCUS", OpCode::TAKE_AUDIO_FOCUS, Mode::Allowed),
    op("AUDIO_MASTER_VOLUME", OpCode::AUDIO_MASTER_VOLUME, Mode::Allowed)
        .restriction("no_adjust_volume"),
    op("AUDIO_VOICE_VOLUME", OpCode::AUDIO_VOICE_VOLUME, Mode::Allowed)
        .restriction("no_adjust_volume"),
    op("AUDIO_RING_VOLUME", OpCode::AUDIO_RING_VOLUME, Mode::Allowed)
        .restriction("no_adjust_volume"),
    op("AUDIO_MEDIA_VOLUME", OpCode::AUDIO_MEDIA_VOLUME, Mode::Allowed)
        .restriction("no_adjust_volume"),
    op("AUDIO_ALARM_VOLUME", OpCode::AUDIO_ALARM_VOLUME, Mode::Allowed)
        .restriction("no_adjust_volume"),
    op(
        "AUDIO_NOTIFICATION_VOLUME",
        OpCode::AUDIO_NOTIFICATION_VOLUME,
        Mode::Allowed,
    )
    .restriction("no_adjust_volume"),
    op(
        "AUDIO_BLUETOOTH_VOLUME",
        OpCode::AUDIO_BLUETOOTH_VOLUME,
        Mode::Allowed,
    )
    .restriction("no_adjust_volume"),
    op("WAKE_LOCK", OpCode::WAKE_LOCK, Mode::Allowed).perm("android.permission.WAKE_LOCK"),
    op("MONITOR_LOCATION", OpCode::COARSE_LOCATION, Mode::Allowed)
        .restriction("no_share_location"),
    op(
        "MONITOR_HIGH_POWER_LOCATION",
        OpCode::COARSE_LOCATION,
        Mode::Allowed,
    )
    .restriction("no_share_location"),
    op("GET_USAGE_STATS", OpCode::GET_USAGE_STATS, Mode::Default)
        .perm("android.permission.PACKAGE_USAGE_STATS"),
    op("MUTE_MICROPHONE", OpCode::MUTE_MICROPHONE, Mode::Allowed)
        .restriction("no_unmute_microphone"),
    op("TOAST_WINDOW", OpCode::TOAST_WINDOW, Mode::Allowed)
        .system_bypass()
        .restriction("no_create_windows"),
    op("PROJECT_MEDIA", OpCode::PROJECT_MEDIA, Mode::Ignored),
    op("ACTIVATE_VPN", OpCode::ACTIVATE_VPN, Mode::Ignored),
    op("WRITE_WALLPAPER", OpCode::WRITE_WALLPAPER, Mode::Allowed),
    op("ASSIST_STRUCTURE", OpCode::ASSIST_STRUCTURE, Mode::Allowed),
    op("ASSIST_SCREENSHOT", OpCode::ASSIST_SCREENSHOT, Mode::Allowed),
    op("READ_PHONE_STATE", OpCode::READ_PHONE_STATE, Mode::Allowed)
        .perm("android.permission.READ_PHONE_STATE"),
    op("ADD_VOICEMAIL", OpCode::ADD_VOICEMAIL, Mode::Allowed)
        .perm("com.android.voicemail.permission.ADD_VOICEMAIL"),
    op("USE_SIP", OpCode::USE_SIP, Mode::Allowed).perm("android.permission.USE_SIP"),
    op(
        "PROCESS_OUTGOING_CALLS",
        OpCode::PROCESS_OUTGOING_CALLS,
        Mode::Allowed,
    )
    .perm("android.permission.PROCESS_OUTGOING_CALLS"),
    op("USE_FINGERPRINT", OpCode::USE_FINGERPRINT, Mode::Allowed)
        .perm("android.permission.USE_FINGERPRINT"),
    op("BODY_SENSORS", OpCode::BODY_SENSORS, Mode::Allowed)
        .perm("android.permission.BODY_SENSORS"),
    op("READ_CELL_BROADCASTS", OpCode::READ_CELL_BROADCASTS, Mode::Allowed)
        .perm("android.permission.READ_CELL_BROADCASTS")
        .restriction("no_sms"),
    op("MOCK_LOCATION", OpCode::MOCK_LOCATION, Mode::Errored),
    op("READ_EXTERNAL_STORAGE", OpCode::READ_EXTERNAL_STORAGE, Mode::Allowed)
        .perm("android.permission.READ_EXTERNAL_STORAGE"),
    op(
        "WRITE_EXTERNAL_STORAGE",
        OpCode::WRITE_EXTERNAL_STORAGE,
        Mode::Allowed,
    )
    .perm("android.permission.WRITE_EXTERNAL_STORAGE"),
    op("TURN_SCREEN_ON", OpCode::TURN_SCREEN_ON, Mode::Allowed),
];
