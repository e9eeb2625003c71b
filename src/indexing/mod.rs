//! The indexing pipeline: chunking, bulk writing, chunk tasks and index
//! lifecycle.

pub mod chunker;
pub mod lifecycle;
pub mod live;
pub mod mapping;
pub mod queue;
pub mod responses;
pub mod tasks;
pub mod writer;

pub use chunker::{chunk_count, chunked, Chunk};
pub use lifecycle::{generation_name, IndexLifecycle, RebuildReport};
pub use live::LiveIndexer;
pub use mapping::{DynMapping, MappingRegistry, MappingType};
pub use queue::{
    Attempt, ChunkTask, DeadLetter, InlineQueue, RetryPolicy, TaskHandler, TaskQueue, WorkerPool,
};
pub use responses::ResponseMapping;
pub use tasks::{new_batch_id, ChunkWorker, Dispatcher};
pub use writer::{ChunkReport, IndexWriter};
