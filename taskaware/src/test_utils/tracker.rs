use crate::host::TaskHandle;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    IncreaseEvents,
    DecreaseEvents,
    Notify,
    RegisterService,
    UnregisterService,
    SpawnFunction,
    WaitFor,
}

const METHODS: [Method; 7] = [
    Method::IncreaseEvents,
    Method::DecreaseEvents,
    Method::Notify,
    Method::RegisterService,
    Method::UnregisterService,
    Method::SpawnFunction,
    Method::WaitFor,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    IncreaseEvents { task: TaskHandle, n: u32 },
    DecreaseEvents { task: TaskHandle, n: u32 },
    Notify,
    RegisterService { name: String },
    UnregisterService { name: String },
    SpawnFunction { label: String },
    WaitFor { micros: u64 },
}

impl Call {
    fn method(&self) -> Method {
        match self {
            Call::IncreaseEvents { .. } => Method::IncreaseEvents,
            Call::DecreaseEvents { .. } => Method::DecreaseEvents,
            Call::Notify => Method::Notify,
            Call::RegisterService { .. } => Method::RegisterService,
            Call::UnregisterService { .. } => Method::UnregisterService,
            Call::SpawnFunction { .. } => Method::SpawnFunction,
            Call::WaitFor { .. } => Method::WaitFor,
        }
    }
}

/// Records every call a mock host receives, grouped by method.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        for method in METHODS {
            map.insert(method, Vec::new());
        }

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, call: Call) {
        self.calls
            .get_mut(&call.method())
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
