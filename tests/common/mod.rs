#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokenflow::compiler::core::Compiler;
use tokenflow::config::{EngineConfig, StoreConfig};
use tokenflow::dsl::SpecificationDef;
use tokenflow::resourcing::directory::{Participant, StaticDirectory};
use tokenflow::runtime::engine::Engine;
use tokenflow::runtime::events::{EngineEvent, EngineListener, EventKind};
use tokenflow::runtime::net::Specification;
use tokenflow::runtime::runner::CaseId;
use tokenflow::runtime::work_item::WorkItem;

pub fn compile(def: SpecificationDef) -> Specification {
    Compiler::new().compile(def).expect("specification should compile")
}

pub fn config() -> EngineConfig {
    EngineConfig {
        resource_on_enable: true,
        store: StoreConfig::None,
        timer_channel_capacity: 16,
    }
}

pub fn clerks() -> StaticDirectory {
    StaticDirectory::new()
        .with(Participant::new("alice").role("clerk"))
        .with(Participant::new("bob").role("clerk"))
}

pub fn engine(directory: StaticDirectory, recorder: Arc<Recorder>) -> Engine {
    Engine::builder()
        .config(config())
        .dispatch(Arc::new(directory))
        .listener(recorder)
        .build()
        .expect("engine should build")
}

pub fn load(engine: &Engine, def: SpecificationDef) -> String {
    let id = engine.load_definition(def).expect("definition should load");
    engine.activate_specification(&id).expect("activation");
    id
}

/// Every work item of `task` in the case, top-level and instances alike.
pub async fn items_of(engine: &Engine, case_id: CaseId, task: &str) -> Vec<WorkItem> {
    engine
        .work_items_for_case(case_id)
        .await
        .expect("case exists")
        .into_iter()
        .filter(|w| w.task_id == task)
        .collect()
}

/// The single active top-level item of `task`.
pub async fn active_item(engine: &Engine, case_id: CaseId, task: &str) -> WorkItem {
    let mut items: Vec<WorkItem> = items_of(engine, case_id, task)
        .await
        .into_iter()
        .filter(|w| w.is_active() && w.parent.is_none())
        .collect();
    assert_eq!(items.len(), 1, "expected one active item for '{}'", task);
    items.remove(0)
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<EngineEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }
}

impl EngineListener for Recorder {
    fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
