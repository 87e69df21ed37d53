//! Structured log events of the compactor.
//!
//! Every event goes to the `chronotrie` target through `tracing`, tagged with
//! the part of the engine that emitted it and a snake_case event name:
//!
//! - `scheduler`: compactor lifecycle and job runs (`compactor_opened`,
//!   `job_started`, `job_published`, `job_failed`, `worker_panicked`, ...).
//!   Job events carry `job` (the `table/trie-key` of the output) and `run_id`,
//!   a ulid unique to one attempt, so retries of the same job stay apart.
//! - `leveled_policy`: a job's tries were written (`job_written`).
//! - `segment_merge`: row counts of one merge (`segments_merged`).
//!
//! No subscriber is installed here; the embedding application decides where
//! events go. Row contents never appear in fields.

/// Target of every chronotrie event.
pub(crate) const CHRONOTRIE_TARGET: &str = "chronotrie";

/// Emit an event at `$level` with the `component` and `event` fields set.
///
/// ```ignore
/// log_event!(INFO, "scheduler", "job_published", job = %key, tries = 2);
/// ```
macro_rules! log_event {
    ($level:ident, $component:literal, $event:literal $(, $($field:tt)*)?) => {
        ::tracing::event!(
            target: $crate::observability::CHRONOTRIE_TARGET,
            ::tracing::Level::$level,
            component = $component,
            event = $event
            $(, $($field)*)?
        )
    };
}

macro_rules! log_trace {
    ($($args:tt)*) => {
        $crate::observability::log_event!(TRACE, $($args)*)
    };
}

macro_rules! log_debug {
    ($($args:tt)*) => {
        $crate::observability::log_event!(DEBUG, $($args)*)
    };
}

macro_rules! log_info {
    ($($args:tt)*) => {
        $crate::observability::log_event!(INFO, $($args)*)
    };
}

macro_rules! log_warn {
    ($($args:tt)*) => {
        $crate::observability::log_event!(WARN, $($args)*)
    };
}

macro_rules! log_error {
    ($($args:tt)*) => {
        $crate::observability::log_event!(ERROR, $($args)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_event;
pub(crate) use log_info;
pub(crate) use log_trace;
pub(crate) use log_warn;

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::{Arc, Mutex},
    };

    use tracing::{
        field::{Field, Visit},
        span, Event, Level, Metadata, Subscriber,
    };

    /// Keeps `level target field=value ...` for every event.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    struct Fields(String);

    impl Visit for Fields {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    impl Subscriber for Recorder {
        fn enabled(&self, _: &Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _: &span::Attributes<'_>) -> span::Id {
            span::Id::from_u64(1)
        }

        fn record(&self, _: &span::Id, _: &span::Record<'_>) {}

        fn record_follows_from(&self, _: &span::Id, _: &span::Id) {}

        fn event(&self, event: &Event<'_>) {
            let meta = event.metadata();
            let mut fields = Fields(format!("{} {}", meta.level(), meta.target()));
            event.record(&mut fields);
            self.0.lock().expect("events").push(fields.0);
        }

        fn enter(&self, _: &span::Id) {}

        fn exit(&self, _: &span::Id) {}
    }

    #[test]
    fn events_carry_component_and_name() {
        let recorder = Recorder::default();
        tracing::subscriber::with_default(recorder.clone(), || {
            log_info!("scheduler", "job_published", job = %"t/k", tries = 2,);
            log_trace!("scheduler", "compactor_idle");
        });

        let events = recorder.0.lock().expect("events").clone();
        assert_eq!(
            events,
            vec![
                format!(
                    "{} chronotrie component=scheduler event=job_published job=t/k tries=2",
                    Level::INFO
                ),
                format!(
                    "{} chronotrie component=scheduler event=compactor_idle",
                    Level::TRACE
                ),
            ]
        );
    }
}
