//! Expert data: loaders, embedding, windowing and prefetching

pub mod embed;
pub mod handler;
pub mod prefetch;
pub mod trajectory;
pub mod window;
pub mod worker;

pub use embed::{Embedder, PassthroughEmbedder, embed_frame};
pub use handler::DataHandler;
pub use prefetch::{Prefetched, Prefetcher};
pub use trajectory::{
    DirectoryLoader, MemoryLoader, TrajectoryLoader, TrajectoryRef, TrajectoryStep,
};
pub use window::{SlidingWindows, TrajectoryWindow, WindowFrame};
pub use worker::{
    EmbeddedTrajectory, PairSampler, PairWorker, PairWorkerConfig, TrajectoryPair, even_indices,
};
