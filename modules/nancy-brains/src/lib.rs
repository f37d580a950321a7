pub mod analytical;
pub mod error;
pub mod graph;
pub mod linguistic;
pub mod predicate;
pub mod testing;
pub mod traits;
pub mod vector;

pub use analytical::PgAnalyticalBrain;
pub use error::BrainError;
pub use graph::{BoltGraphBrain, GraphClient};
pub use linguistic::LlmLinguistic;
pub use predicate::Predicate;
pub use traits::{
    AnalyticalBrain, BrainSet, CompensationRow, GraphBrain, GraphEdge, GraphNode, GraphPath,
    LinguisticBrain, PacketIndexRow, SearchHit, Subgraph, TextEmbedder, VectorBrain,
};
pub use vector::{CachedEmbedder, PgVectorBrain};
