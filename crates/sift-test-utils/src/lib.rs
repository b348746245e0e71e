pub mod fixtures;
pub mod memory_sink;
pub mod mock_inference;
pub mod mock_resource;
pub mod stub;

pub use memory_sink::MemorySink;
pub use mock_inference::MockInference;
pub use mock_resource::{not_found, MockResource};
pub use stub::{StubCall, StubLog, StubStrategy};
