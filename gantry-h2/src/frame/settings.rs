use std::fmt;

use bytes::BufMut;

use super::{debug_flags, unpack_u32, Error, FrameSize, Head, Kind, StreamId};

/// The default value of SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: usize = 4_096;

/// The default value of SETTINGS_INITIAL_WINDOW_SIZE.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// The default value of SETTINGS_MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: FrameSize = 16_384;

/// INITIAL_WINDOW_SIZE upper bound.
pub const MAX_INITIAL_WINDOW_SIZE: usize = (1 << 31) - 1;

/// MAX_FRAME_SIZE upper bound.
pub const MAX_MAX_FRAME_SIZE: FrameSize = (1 << 24) - 1;

/// A SETTINGS frame: either an ACK or a list of parameter updates that
/// must be ACKed once applied.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Settings {
    flags: SettingsFlags,
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<u32>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

#[derive(Copy, Clone, Default, Eq, PartialEq)]
struct SettingsFlags(u8);

const ACK: u8 = 0x1;
const ALL: u8 = ACK;

/// One 6-octet setting tuple.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    Unknown(u16),
}

// ===== impl Settings =====

impl Settings {
    #[must_use]
    pub fn ack() -> Self {
        Self {
            flags: SettingsFlags(ACK),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.flags.is_ack()
    }

    #[must_use]
    pub fn header_table_size(&self) -> Option<u32> {
        self.header_table_size
    }

    pub fn set_header_table_size(&mut self, size: Option<u32>) {
        self.header_table_size = size;
    }

    #[must_use]
    pub fn initial_window_size(&self) -> Option<u32> {
        self.initial_window_size
    }

    pub fn set_initial_window_size(&mut self, size: Option<u32>) {
        self.initial_window_size = size;
    }

    #[must_use]
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    #[must_use]
    pub fn max_frame_size(&self) -> Option<u32> {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, size: Option<u32>) {
        if let Some(val) = size {
            debug_assert!((DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&val));
        }
        self.max_frame_size = size;
    }

    #[must_use]
    pub fn max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    pub fn set_max_header_list_size(&mut self, size: Option<u32>) {
        self.max_header_list_size = size;
    }

    #[must_use]
    pub fn is_push_enabled(&self) -> Option<bool> {
        self.enable_push.map(|val| val != 0)
    }

    pub fn set_enable_push(&mut self, enable: bool) {
        self.enable_push = Some(enable as u32);
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let flags = SettingsFlags::load(head.flag());

        if flags.is_ack() {
            if !payload.is_empty() {
                return Err(Error::InvalidPayloadAckSettings);
            }
            return Ok(Self::ack());
        }

        // Each setting is a 6-octet tuple; anything else is malformed.
        if payload.len() % 6 != 0 {
            tracing::debug!(len = payload.len(), "invalid SETTINGS payload length");
            return Err(Error::BadFrameSize);
        }

        let mut settings = Self::default();
        for raw in payload.chunks(6) {
            let setting = Setting::load(raw);
            match setting.id {
                SettingId::HeaderTableSize => {
                    settings.header_table_size = Some(setting.value);
                }
                SettingId::EnablePush => match setting.value {
                    0 | 1 => settings.enable_push = Some(setting.value),
                    _ => return Err(Error::InvalidSettingValue),
                },
                SettingId::MaxConcurrentStreams => {
                    settings.max_concurrent_streams = Some(setting.value);
                }
                SettingId::InitialWindowSize => {
                    if setting.value as usize > MAX_INITIAL_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.initial_window_size = Some(setting.value);
                }
                SettingId::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&setting.value) {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.max_frame_size = Some(setting.value);
                }
                SettingId::MaxHeaderListSize => {
                    settings.max_header_list_size = Some(setting.value);
                }
                SettingId::Unknown(id) => {
                    tracing::trace!(id, value = setting.value, "ignoring unknown setting");
                }
            }
        }

        Ok(settings)
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        self.for_each(|_| len += 6);
        len
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Settings, self.flags.into(), StreamId::ZERO);
        let payload_len = self.payload_len();
        tracing::trace!(len = payload_len, "encoding SETTINGS");
        head.encode(payload_len, dst);
        self.for_each(|setting| setting.encode(dst));
    }

    fn for_each<F: FnMut(Setting)>(&self, mut f: F) {
        let fields = [
            (SettingId::HeaderTableSize, self.header_table_size),
            (SettingId::EnablePush, self.enable_push),
            (SettingId::MaxConcurrentStreams, self.max_concurrent_streams),
            (SettingId::InitialWindowSize, self.initial_window_size),
            (SettingId::MaxFrameSize, self.max_frame_size),
            (SettingId::MaxHeaderListSize, self.max_header_list_size),
        ];
        for (id, value) in fields {
            if let Some(value) = value {
                f(Setting { id, value });
            }
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Settings");
        builder.field("flags", &self.flags);
        self.for_each(|setting| {
            builder.field(setting.id.name(), &setting.value);
        });
        builder.finish()
    }
}

// ===== impl Setting =====

impl Setting {
    /// Parses one 6-octet tuple.
    #[must_use]
    pub fn load(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= 6);
        let id = u16::from(raw[0]) << 8 | u16::from(raw[1]);
        Self {
            id: SettingId::new(id),
            value: unpack_u32(raw, 2),
        }
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.id.into());
        dst.put_u32(self.value);
    }
}

// ===== impl SettingId =====

impl SettingId {
    #[must_use]
    pub fn new(id: u16) -> Self {
        match id {
            1 => Self::HeaderTableSize,
            2 => Self::EnablePush,
            3 => Self::MaxConcurrentStreams,
            4 => Self::InitialWindowSize,
            5 => Self::MaxFrameSize,
            6 => Self::MaxHeaderListSize,
            other => Self::Unknown(other),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::HeaderTableSize => "header_table_size",
            Self::EnablePush => "enable_push",
            Self::MaxConcurrentStreams => "max_concurrent_streams",
            Self::InitialWindowSize => "initial_window_size",
            Self::MaxFrameSize => "max_frame_size",
            Self::MaxHeaderListSize => "max_header_list_size",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<SettingId> for u16 {
    fn from(src: SettingId) -> Self {
        match src {
            SettingId::HeaderTableSize => 1,
            SettingId::EnablePush => 2,
            SettingId::MaxConcurrentStreams => 3,
            SettingId::InitialWindowSize => 4,
            SettingId::MaxFrameSize => 5,
            SettingId::MaxHeaderListSize => 6,
            SettingId::Unknown(other) => other,
        }
    }
}

// ===== impl SettingsFlags =====

impl SettingsFlags {
    fn load(bits: u8) -> Self {
        Self(bits & ALL)
    }

    fn is_ack(&self) -> bool {
        self.0 & ACK == ACK
    }
}

impl From<SettingsFlags> for u8 {
    fn from(src: SettingsFlags) -> Self {
        src.0
    }
}

impl fmt::Debug for SettingsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_flags(f, self.0).flag_if(self.is_ack(), "ACK").finish()
    }
}
