//! Helper macro enforcing consistent per-site log fields.
//!
//! Every event emitted from the poll and resolution layers carries `site` and
//! `vhost` so the output of concurrent workers can be told apart.

/// Log an event for a site plus any extra display fields.
#[macro_export]
macro_rules! site_event {
    ($level:ident, $target:expr, $event:expr, site = $site:expr, vhost = $vhost:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            site = %$site,
            vhost = %$vhost,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, site = $site:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            site = %$site,
            $($field = %$value,)*
        )
    };
}
