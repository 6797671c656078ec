pub mod fakes;
pub mod harness;
pub mod server;

pub use fakes::{EngineReply, FakeScheduler, FakeWorkflowEngine, ScriptedJob};
pub use harness::TestContext;
pub use server::FakeEngineServer;
