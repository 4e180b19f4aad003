//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Level-specific logging macros that flatten a [`crate::LogContext`] into
//! structured fields.

/// Emit an event at the given level enriched with transport context.
#[macro_export]
macro_rules! pt_event {
    ($level:expr, context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            session = ctx.session.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            worker = ?ctx.worker,
            message = %format_args!($($arg)+)
        );
    }};
    ($level:expr, $($arg:tt)+) => {{
        $crate::pt_event!($level, context = $crate::LogContext::default(), $($arg)+)
    }};
}

/// Emit an informational log enriched with transport context.
#[macro_export]
macro_rules! pt_info {
    ($($arg:tt)+) => { $crate::pt_event!(tracing::Level::INFO, $($arg)+) };
}

/// Emit a debug log enriched with transport context.
#[macro_export]
macro_rules! pt_debug {
    ($($arg:tt)+) => { $crate::pt_event!(tracing::Level::DEBUG, $($arg)+) };
}

/// Emit a warning log enriched with transport context.
#[macro_export]
macro_rules! pt_warn {
    ($($arg:tt)+) => { $crate::pt_event!(tracing::Level::WARN, $($arg)+) };
}

/// Emit an error log enriched with transport context.
#[macro_export]
macro_rules! pt_error {
    ($($arg:tt)+) => { $crate::pt_event!(tracing::Level::ERROR, $($arg)+) };
}
