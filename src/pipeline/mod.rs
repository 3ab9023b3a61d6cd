//! The contig-split alignment pipelines built on the engine.

pub mod align;
pub mod split;

use crate::engine::{Collect, Registry, TwoPhase};

/// Registers every job kind the pipelines create, so their workflows can be
/// restarted.
pub fn register(registry: &mut Registry) -> &mut Registry {
    registry
        .register::<split::GraphmapSplit>()
        .register::<split::Gunzip>()
        .register::<TwoPhase<split::SplitGraph>>()
        .register::<split::SplitFastas>()
        .register::<TwoPhase<split::SplitFasta>>()
        .register::<Collect<TwoPhase<split::SplitFasta>>>()
        .register::<split::GatherFastas>()
        .register::<align::AlignBatch>()
        .register::<align::AlignChrom>()
        .register::<TwoPhase<align::ExportVg>>()
        .register::<align::PackageAlignment>()
        .register::<Collect<align::AlignChrom>>()
}
