use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::{DecodeError, MioError, Result},
    validate::Validate,
};

/// Size of the header every command frame starts with: group byte + sub-command byte
pub const FRAME_HEADER_SIZE: usize = 2;

/// Size of the user settings frame
pub const USER_INFO_FRAME_SIZE: usize = 10;

/// Sub-command selecting "set user settings" within [`CommandType::UserInfoSet`]
pub const SUB_USER_SETTINGS_SET: u8 = 0x00;

/// Command groups understood by the device firmware
///
/// The discriminant is the first byte of every [`CommandFrame`]. Only a few groups
/// have a known payload layout; see [`CommandType::codec_support`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandType {
    /// No command
    None = 0,
    /// Set heart rate zones
    HrSet,
    /// Get heart rate zones
    HrGet,
    /// Set bike settings
    BikeSet,
    /// Get bike settings
    BikeGet,
    /// Get application type
    AppTypeGet,
    /// Set application type
    AppTypeSet,
    /// Get user settings
    UserInfoGet,
    /// Set user settings
    UserInfoSet,
    /// Get device name
    NameGet,
    /// Set device name
    NameSet,
    /// Get real time clock
    RtcGet,
    /// Set real time clock
    RtcSet,
    /// Run a [`RunCommand`]
    RunCmd,
    /// Push GPS data to the device
    SendGpsData,
    /// Get display settings
    DisplayGet,
    /// Set display settings
    DisplaySet,
    /// Get daily goal
    DailyGoalGet,
    /// Set daily goal
    DailyGoalSet,
    /// Get device status
    DeviceStatusGet,
    /// Get today's activity-of-daily-living record
    TodayAdlRecordGet,
    /// Get stored record
    RecordGet,
    /// Delete stored record
    RecordDelete,
    /// Get workout session
    SessionGet,
    /// Link custom command
    LinkCustCmd,
    /// Put a Link into firmware update mode
    LinkEnterDfuMode,
    /// Put an Alpha 2 into firmware update mode
    Alpha2EnterDfuMode,
    /// Link firmware update
    LinkUpdate,
    /// Alpha 2 firmware update
    Alpha2Update,
    /// Get stride calibration
    StrideCaliGet,
    /// Set stride calibration
    StrideCaliSet,
    /// Restore factory defaults
    FactoryDefault,
    /// Get swing arm setting
    SwingArmGet,
    /// Set swing arm setting
    SwingArmSet,
    /// Get Velo device status
    VeloDeviceStatusGet,
    /// Get Velo memory record
    VeloMemRecordGet,
    /// Get Velo memory session
    VeloMemSessionGet,
    /// Delete Velo memory record
    VeloMemRecordDel,
    /// Mobile notification
    LinkMobileNotification,
    /// Mobile message alert
    LinkMobileMsgAlert,
    /// Mobile email alert
    LinkMobileEmailAlert,
    /// Mobile phone call alert
    LinkMobilePhoneAlert,
    /// Get sleep record
    SleepRecordGet,
    /// Delete sleep record
    SleepRecordDelete,
    /// Sleep record for the current hour
    SleepRecordCurHour,
    /// Get device options
    DeviceOptionGet,
    /// Set device options
    DeviceOptionSet,
}

/// How far a command group's layout is understood
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSupport {
    /// Frames can be built; the reply layout is reserved
    EncodeOnly,
    /// Named by the firmware, layout unknown
    Unimplemented,
}

impl CommandType {
    /// Every command group, indexed by its wire value
    pub const ALL: [Self; 47] = [
        Self::None,
        Self::HrSet,
        Self::HrGet,
        Self::BikeSet,
        Self::BikeGet,
        Self::AppTypeGet,
        Self::AppTypeSet,
        Self::UserInfoGet,
        Self::UserInfoSet,
        Self::NameGet,
        Self::NameSet,
        Self::RtcGet,
        Self::RtcSet,
        Self::RunCmd,
        Self::SendGpsData,
        Self::DisplayGet,
        Self::DisplaySet,
        Self::DailyGoalGet,
        Self::DailyGoalSet,
        Self::DeviceStatusGet,
        Self::TodayAdlRecordGet,
        Self::RecordGet,
        Self::RecordDelete,
        Self::SessionGet,
        Self::LinkCustCmd,
        Self::LinkEnterDfuMode,
        Self::Alpha2EnterDfuMode,
        Self::LinkUpdate,
        Self::Alpha2Update,
        Self::StrideCaliGet,
        Self::StrideCaliSet,
        Self::FactoryDefault,
        Self::SwingArmGet,
        Self::SwingArmSet,
        Self::VeloDeviceStatusGet,
        Self::VeloMemRecordGet,
        Self::VeloMemSessionGet,
        Self::VeloMemRecordDel,
        Self::LinkMobileNotification,
        Self::LinkMobileMsgAlert,
        Self::LinkMobileEmailAlert,
        Self::LinkMobilePhoneAlert,
        Self::SleepRecordGet,
        Self::SleepRecordDelete,
        Self::SleepRecordCurHour,
        Self::DeviceOptionGet,
        Self::DeviceOptionSet,
    ];

    /// Convert from u8
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    /// Which codec, if any, backs this group
    #[must_use]
    pub const fn codec_support(self) -> CodecSupport {
        match self {
            Self::UserInfoSet => CodecSupport::EncodeOnly,
            _ => CodecSupport::Unimplemented,
        }
    }

    /// Whether this group belongs to a firmware update flow
    #[must_use]
    pub const fn is_dfu(self) -> bool {
        matches!(
            self,
            Self::LinkEnterDfuMode | Self::Alpha2EnterDfuMode | Self::LinkUpdate | Self::Alpha2Update
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02X})", *self as u8)
    }
}

/// Sub-commands of [`CommandType::RunCmd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunCommand {
    /// Stop streaming mode
    StreamModeDisable = 0,
    /// Start streaming mode
    StreamModeEnable,
    /// Stop GPS mode
    GpsModeDisable,
    /// Start GPS mode
    GpsModeEnable,
    /// Reset today's activity data
    ResetTodayAdlData,
    /// Stop step notifications
    StepDataNotifyDisable,
    /// Start step notifications
    StepDataNotifyEnable,
    /// Enter airplane mode
    AirplaneModeEnable,
    /// Clear memory
    MemClear,
    /// Back up user data
    UserdataBackup,
    /// Stop timer sync notifications
    EtsNotificationDisable,
    /// Start timer sync notifications
    EtsNotificationEnable,
    /// Start the synced timer
    EtsStartTimer,
    /// Stop the synced timer
    EtsStopTimer,
    /// Take a lap
    EtsTakeLap,
    /// Resend the last lap
    EtsResendLap,
    /// Finish the timed session
    EtsFinish,
    /// Leave sleep mode
    SleepModeDeactivate,
    /// Enter sleep mode
    SleepModeActivate,
    /// Start a resting heart rate measurement
    RestHrTakeMeasurement,
    /// Stop a resting heart rate measurement
    RestHrStopMeasurement,
    /// Send the resting heart rate measurement
    RestHrSendMeasurement,
    /// Clear activity memory
    ActMemClear,
    /// Clear activity-of-daily-living memory
    AdlMemClear,
}

impl RunCommand {
    /// Every run sub-command, indexed by its wire value
    pub const ALL: [Self; 24] = [
        Self::StreamModeDisable,
        Self::StreamModeEnable,
        Self::GpsModeDisable,
        Self::GpsModeEnable,
        Self::ResetTodayAdlData,
        Self::StepDataNotifyDisable,
        Self::StepDataNotifyEnable,
        Self::AirplaneModeEnable,
        Self::MemClear,
        Self::UserdataBackup,
        Self::EtsNotificationDisable,
        Self::EtsNotificationEnable,
        Self::EtsStartTimer,
        Self::EtsStopTimer,
        Self::EtsTakeLap,
        Self::EtsResendLap,
        Self::EtsFinish,
        Self::SleepModeDeactivate,
        Self::SleepModeActivate,
        Self::RestHrTakeMeasurement,
        Self::RestHrStopMeasurement,
        Self::RestHrSendMeasurement,
        Self::ActMemClear,
        Self::AdlMemClear,
    ];

    /// Convert from u8
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }
}

/// One device instruction on the wire
///
/// - Byte 0: command group ([`CommandType`])
/// - Byte 1: sub-command selector
/// - Bytes 2..: group specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command group
    pub command: CommandType,
    /// Sub-command selector
    pub sub_command: u8,
    /// Payload following the header
    pub payload: Bytes,
}

impl CommandFrame {
    /// Create a frame without checking whether the group has a known layout
    pub fn new(command: CommandType, sub_command: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            sub_command,
            payload: payload.into(),
        }
    }

    /// Create a frame for a group whose layout is known
    ///
    /// # Errors
    ///
    /// Returns [`MioError::NotImplemented`] if the group is still unmapped.
    pub fn checked(command: CommandType, sub_command: u8, payload: impl Into<Bytes>) -> Result<Self> {
        if command.codec_support() == CodecSupport::Unimplemented {
            return Err(MioError::NotImplemented {
                command: command.to_string(),
            });
        }
        Ok(Self::new(command, sub_command, payload))
    }

    /// Total encoded length
    #[must_use]
    pub fn len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Whether the frame carries no payload
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize frame to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_u8(self.command as u8);
        buf.put_u8(self.sub_command);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse frame from bytes
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the header is truncated or names an unknown group.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(DecodeError::WrongLength {
                format: "command frame",
                expected: format!(">= {FRAME_HEADER_SIZE}"),
                actual: data.len(),
            });
        }

        let mut buf = data;
        let group = buf.get_u8();
        let sub_command = buf.get_u8();
        let command = CommandType::from_u8(group).ok_or_else(|| DecodeError::Malformed {
            format: "command frame",
            reason: format!("unknown command group 0x{group:02X}"),
        })?;

        Ok(Self {
            command,
            sub_command,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Encode/decode pair for one command type
///
/// New command types are added by implementing this trait and flipping their entry
/// in [`CommandType::codec_support`]. The session only ever sees [`CommandFrame`]s.
pub trait CommandCodec {
    /// Structured record carried by the frame
    type Record;

    /// Group byte
    const COMMAND: CommandType;

    /// Sub-command byte
    const SUB_COMMAND: u8;

    /// Validate `record` with `validator`, then pack it
    ///
    /// # Errors
    ///
    /// Returns [`MioError::Validation`] listing every failing field; no frame is built.
    fn encode<V>(record: &Self::Record, validator: &V) -> Result<CommandFrame>
    where
        V: Validate<Self::Record> + ?Sized;

    /// Parse the record back out of a frame
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the frame is malformed or the layout is not known.
    fn decode(frame: &CommandFrame) -> std::result::Result<Self::Record, DecodeError>;
}

/// User settings bitmask, byte 2 of the user settings frame
pub mod user_flags {
    /// Gender
    pub const GENDER: u8 = 1 << 0;
    /// Unit system
    pub const UNIT_TYPE: u8 = 1 << 1;
    /// Heart rate display type
    pub const DISPLAY_TYPE_HR: u8 = 1 << 2;
    /// Display orientation
    pub const DISPLAY_ORIENTATION: u8 = 1 << 3;
    /// Workout display mode
    pub const DISPLAY_MODE_WO: u8 = 1 << 4;
    /// Activity-of-daily-living goal mode
    pub const GOAL_ADL: u8 = 1 << 5;
    /// Workout recording
    pub const RECORDING_WO: u8 = 1 << 6;
    /// Heart rate auto adjust
    pub const ADJ_HR: u8 = 1 << 7;
}

/// User profile stored on the device
///
/// Flag fields are raw bytes and must be 0 or 1; see [`crate::validate::UserInfoRules`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Gender flag
    pub gender: u8,
    /// Unit system flag
    pub unit_type: u8,
    /// Heart rate display type flag
    pub hr_display_type: u8,
    /// Display orientation flag
    pub display_orientation: u8,
    /// Workout display mode flag
    pub workout_display_mode: u8,
    /// Activity goal mode flag
    pub adl_goal_mode: u8,
    /// Workout recording flag
    pub workout_recording: u8,
    /// Heart rate auto adjust flag
    pub hr_auto_adjust: u8,
    /// Date of birth
    pub birthday: NaiveDate,
    /// Body weight, 20..=200
    pub body_weight: u8,
    /// Body height, 69..=231
    pub body_height: u8,
    /// Resting heart rate, 30..=140 and below `max_hr`
    pub resting_hr: u8,
    /// Maximum heart rate, 80..=220
    pub max_hr: u8,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            gender: 0,
            unit_type: 0,
            hr_display_type: 0,
            display_orientation: 0,
            workout_display_mode: 0,
            adl_goal_mode: 0,
            workout_recording: 0,
            hr_auto_adjust: 0,
            birthday: NaiveDate::default(),
            body_weight: 70,
            body_height: 170,
            resting_hr: 60,
            max_hr: 190,
        }
    }
}

impl UserInfo {
    /// Pack the eight flag fields into the settings bitmask
    #[must_use]
    pub fn flags(&self) -> u8 {
        [
            (self.gender, user_flags::GENDER),
            (self.unit_type, user_flags::UNIT_TYPE),
            (self.hr_display_type, user_flags::DISPLAY_TYPE_HR),
            (self.display_orientation, user_flags::DISPLAY_ORIENTATION),
            (self.workout_display_mode, user_flags::DISPLAY_MODE_WO),
            (self.adl_goal_mode, user_flags::GOAL_ADL),
            (self.workout_recording, user_flags::RECORDING_WO),
            (self.hr_auto_adjust, user_flags::ADJ_HR),
        ]
        .into_iter()
        .filter(|(value, _)| *value == 1)
        .fold(0, |flags, (_, bit)| flags | bit)
    }
}

/// Codec for [`CommandType::UserInfoSet`]
#[derive(Debug, Clone, Copy)]
pub struct UserInfoSet;

impl CommandCodec for UserInfoSet {
    type Record = UserInfo;

    const COMMAND: CommandType = CommandType::UserInfoSet;
    const SUB_COMMAND: u8 = SUB_USER_SETTINGS_SET;

    fn encode<V>(info: &UserInfo, validator: &V) -> Result<CommandFrame>
    where
        V: Validate<UserInfo> + ?Sized,
    {
        validator.validate(info)?;

        let mut payload = BytesMut::with_capacity(USER_INFO_FRAME_SIZE - FRAME_HEADER_SIZE);
        payload.put_u8(info.flags());
        // Day and month always fit a byte.
        payload.put_u8(info.birthday.day() as u8);
        payload.put_u8(info.birthday.month() as u8);
        // The firmware only takes the low byte of the year (1985 goes out as 0xC1).
        // Widening this would change the frame size the device expects.
        payload.put_u8((info.birthday.year() & 0xFF) as u8);
        payload.put_u8(info.body_weight);
        payload.put_u8(info.body_height);
        payload.put_u8(info.resting_hr);
        payload.put_u8(info.max_hr);

        Ok(CommandFrame::new(Self::COMMAND, Self::SUB_COMMAND, payload.freeze()))
    }

    fn decode(_frame: &CommandFrame) -> std::result::Result<UserInfo, DecodeError> {
        // The device has never been seen sending this frame back.
        Err(DecodeError::NotImplemented {
            format: "user settings",
        })
    }
}

/// Validate and pack a user profile into its 10-byte settings frame
///
/// # Errors
///
/// Returns [`MioError::Validation`] listing every failing field.
pub fn encode_user_info<V>(info: &UserInfo, validator: &V) -> Result<Bytes>
where
    V: Validate<UserInfo> + ?Sized,
{
    UserInfoSet::encode(info, validator).map(|frame| frame.to_bytes())
}

/// Parse a user settings frame
///
/// # Errors
///
/// Always returns [`DecodeError::NotImplemented`] for now; a truncated frame is
/// reported as [`DecodeError::WrongLength`] first.
pub fn decode_user_info(data: &[u8]) -> std::result::Result<UserInfo, DecodeError> {
    if data.len() != USER_INFO_FRAME_SIZE {
        return Err(DecodeError::WrongLength {
            format: "user settings",
            expected: USER_INFO_FRAME_SIZE.to_string(),
            actual: data.len(),
        });
    }
    let frame = CommandFrame::from_bytes(data)?;
    UserInfoSet::decode(&frame)
}
