pub mod case;
pub mod engine;
pub mod events;
pub mod marking;
pub mod net;
pub mod or_join;
pub mod predicate;
pub mod redis_storage;
pub mod runner;
pub mod storage;
pub mod work_item;
