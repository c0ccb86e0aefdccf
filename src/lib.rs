pub mod dispatch;
pub mod fetch;
pub mod logging;
pub mod proxy;
pub mod push;
pub mod snode;
pub mod storage;
pub mod swarm;
pub mod web;
