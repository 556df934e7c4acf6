//! Side-effect-free rechunk plans.
//!
//! A [`RechunkPlan`] is the full description of a rewrite: which arrays get
//! created, with which chunking, and which blocks are copied in which order.
//! Building one touches no storage; running it is the job of
//! [`ExecutionContext::execute`](crate::executor::ExecutionContext::execute).

use serde::{Deserialize, Serialize};

use crate::config::{ByteSize, RechunkConfig};
use crate::error::Result;
use crate::planner::{negotiate, ChunkNegotiation};
use crate::types::{ArrayDescriptor, Block, ChunkShape, Partition};

/// An array the plan reads from or creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySpec {
    /// Node path inside the store, e.g. `/cmip6/tos_target.zarr`.
    pub path: String,
    pub shape: Vec<u64>,
    pub chunks: ChunkShape,
}

/// Role of a copy stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Source blocks into the staging store.
    SourceToStaging,
    /// Staging blocks into the target store.
    StagingToTarget,
    /// Source blocks straight into the target store.
    SourceToTarget,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceToStaging => "source_to_staging",
            Self::StagingToTarget => "staging_to_target",
            Self::SourceToTarget => "source_to_target",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: copy `block` from the stage input to its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTask {
    pub index: usize,
    pub block: Block,
}

/// A set of independent block copies between two arrays.
///
/// Blocks never straddle a chunk of the output array, so tasks of a stage can
/// run in any order and in parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyStage {
    pub kind: StageKind,
    pub from: String,
    pub to: String,
    pub shape: Vec<u64>,
    /// Extent of one task block.
    pub block: ChunkShape,
}

impl CopyStage {
    /// Tasks of this stage in row-major block order.
    pub fn tasks(&self) -> impl ExactSizeIterator<Item = CopyTask> + '_ {
        self.blocks()
            .enumerate()
            .map(|(index, block)| CopyTask { index, block })
    }

    fn blocks(&self) -> Partition<'_> {
        self.block.partition(&self.shape)
    }

    pub fn task_count(&self) -> usize {
        self.blocks().len()
    }
}

/// Complete description of a rechunk, built without touching storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechunkPlan {
    pub source: ArraySpec,
    pub target: ArraySpec,
    /// Staging array, absent when source blocks can be written to the target
    /// directly.
    pub staging: Option<ArraySpec>,
    pub item_size: u64,
    pub max_mem: ByteSize,
    pub negotiation: ChunkNegotiation,
    stages: Vec<CopyStage>,
}

impl RechunkPlan {
    /// Plan the rewrite of the array at `source_path` into `target_chunks`.
    ///
    /// Fails with a configuration error when the memory budget cannot hold a
    /// single source or target chunk.
    pub fn build(
        source_path: &str,
        source: &ArrayDescriptor,
        target_chunks: &ChunkShape,
        config: &RechunkConfig,
        staging_path: &str,
        target_path: &str,
    ) -> Result<Self> {
        config.validate()?;
        let max_mem = config.max_mem;
        let negotiation = negotiate(source, target_chunks, max_mem.as_u64())?;
        let shape = source.shape.clone();

        let source_spec = ArraySpec {
            path: source_path.to_string(),
            shape: shape.clone(),
            chunks: source.chunks.clone(),
        };
        let target_spec = ArraySpec {
            path: target_path.to_string(),
            shape: shape.clone(),
            chunks: negotiation.target.clone(),
        };

        let (staging, stages) = if negotiation.needs_staging {
            let staging_spec = ArraySpec {
                path: staging_path.to_string(),
                shape: shape.clone(),
                chunks: negotiation.intermediate.clone(),
            };
            let stages = vec![
                CopyStage {
                    kind: StageKind::SourceToStaging,
                    from: source_path.to_string(),
                    to: staging_path.to_string(),
                    shape: shape.clone(),
                    block: negotiation.read.clone(),
                },
                CopyStage {
                    kind: StageKind::StagingToTarget,
                    from: staging_path.to_string(),
                    to: target_path.to_string(),
                    shape: shape.clone(),
                    block: negotiation.write.clone(),
                },
            ];
            (Some(staging_spec), stages)
        } else {
            let stages = vec![CopyStage {
                kind: StageKind::SourceToTarget,
                from: source_path.to_string(),
                to: target_path.to_string(),
                shape: shape.clone(),
                block: negotiation.read.clone(),
            }];
            (None, stages)
        };

        Ok(Self {
            source: source_spec,
            target: target_spec,
            staging,
            item_size: source.item_size,
            max_mem,
            negotiation,
            stages,
        })
    }

    pub fn stages(&self) -> &[CopyStage] {
        &self.stages
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(CopyStage::task_count).sum()
    }

    /// Largest number of bytes a single task holds in memory.
    pub fn peak_task_bytes(&self) -> u64 {
        self.stages
            .iter()
            .map(|stage| stage.block.clamped(&stage.shape).num_elements() * self.item_size)
            .max()
            .unwrap_or(0)
    }

    /// Human-readable description for dry runs.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "rechunk {} {} -> {} {}\n",
            self.source.path, self.source.chunks, self.target.path, self.target.chunks
        ));
        out.push_str(&format!(
            "  shape {}, memory budget {}, peak per task {}\n",
            ChunkShape(self.source.shape.clone()),
            self.max_mem,
            ByteSize(self.peak_task_bytes())
        ));
        match &self.staging {
            Some(staging) => out.push_str(&format!(
                "  staging {} chunks {}\n",
                staging.path, staging.chunks
            )),
            None => out.push_str("  staging not required\n"),
        }
        for stage in &self.stages {
            out.push_str(&format!(
                "  stage {}: {} task(s) of {}\n",
                stage.kind,
                stage.task_count(),
                stage.block
            ));
        }
        out
    }
}
