//! Internal logging macros.

/// Logs a protocol violation at debug level, tagged with the scope that
/// pays for it (connection or stream).
macro_rules! proto_err {
    (conn: $($msg:tt)+) => {
        tracing::debug!("connection error PROTOCOL_ERROR -- {}", format_args!($($msg)+));
    };
    (stream: $($msg:tt)+) => {
        tracing::debug!("stream error -- {}", format_args!($($msg)+));
    };
}
