mod mocks;
pub(crate) use mocks::{MockEvent, MockHost, mock_tasking};

mod tracker;
pub(crate) use tracker::{Call, Method, Tracker};
