/*!
# Sensorhub DevKit - Stubs and test utilities

Helpers for exercising the sensorhub core without a broker or browsers:
- Viewer transports that record, fail or stall
- Config fixtures resolved through the real resolver
- A harness wiring ingestion, bridge entry point and poller together
*/

pub mod fixtures;
pub mod test_utils;
pub mod viewer_stub;

pub use fixtures::ConfigFixture;
pub use test_utils::{wait_until, TestHarness};
pub use viewer_stub::{FailingViewer, RecordingViewer, StalledViewer, ViewerLog};
