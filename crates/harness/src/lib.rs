//! Test tooling for the livetree workspace: a pre-seeded host plus
//! notifier doubles used by the integration suites.

mod host;

pub use host::{RecordedEvent, RecordingNotifier, TestHost, VetoNotifier};
