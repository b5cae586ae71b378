//! The `h2.*` tuning options.

use serde::Deserialize;

use crate::frame::{
    Settings, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE,
};

/// Engine tuning, mapping the `h2.*` process options. Values outside the
/// RFC ranges are rejected by [`H2Config::validate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct H2Config {
    /// Initial HPACK decoding table size advertised to peers.
    pub header_table_size: u32,
    /// Per-stream initial window advertised to peers.
    pub initial_window_size: u32,
    /// Advertised concurrent stream cap; 0 means "do not advertise".
    pub max_concurrent_streams: u32,
    /// Advertised SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: u32,
    /// Advertised SETTINGS_MAX_HEADER_LIST_SIZE; None leaves it out.
    pub max_header_list_size: Option<u32>,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            header_table_size: 4_096,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_concurrent_streams: 100,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

/// Rejected [`H2Config`] values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2ConfigError {
    HeaderTableSize(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
}

impl std::fmt::Display for H2ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeaderTableSize(v) => {
                write!(f, "h2.header-table-size {v} outside 4096..=65536")
            }
            Self::InitialWindowSize(v) => {
                write!(f, "h2.initial-window-size {v} above 2^31-1")
            }
            Self::MaxFrameSize(v) => {
                write!(f, "h2.max-frame-size {v} outside 16384..=16777215")
            }
        }
    }
}

impl std::error::Error for H2ConfigError {}

impl H2Config {
    pub fn validate(&self) -> Result<(), H2ConfigError> {
        if !(4_096..=65_536).contains(&self.header_table_size) {
            return Err(H2ConfigError::HeaderTableSize(self.header_table_size));
        }
        if self.initial_window_size > (1 << 31) - 1 {
            return Err(H2ConfigError::InitialWindowSize(self.initial_window_size));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(H2ConfigError::MaxFrameSize(self.max_frame_size));
        }
        Ok(())
    }

    /// The initial SETTINGS frame this configuration advertises. Values
    /// matching protocol defaults are left out of the frame.
    #[must_use]
    pub fn to_settings(&self) -> Settings {
        let mut settings = Settings::default();
        if self.header_table_size != 4_096 {
            settings.set_header_table_size(Some(self.header_table_size));
        }
        if self.initial_window_size != DEFAULT_INITIAL_WINDOW_SIZE {
            settings.set_initial_window_size(Some(self.initial_window_size));
        }
        if self.max_concurrent_streams != 0 {
            settings.set_max_concurrent_streams(Some(self.max_concurrent_streams));
        }
        if self.max_frame_size != DEFAULT_MAX_FRAME_SIZE {
            settings.set_max_frame_size(Some(self.max_frame_size));
        }
        settings.set_max_header_list_size(self.max_header_list_size);
        settings
    }
}
