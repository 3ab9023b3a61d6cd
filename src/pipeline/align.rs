//! Batch alignment of contig-split inputs with `cactus-align`.
//!
//! One [`AlignChrom`] task runs per chromosome, their starts staggered so the
//! cluster is not hit by every alignment at once. Each may convert its HAL
//! output to vg and GFA, and may checkpoint everything to a durable sink as
//! soon as it exists.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::engine::{
    Deferred, FanOut, Job, JobContext, Promise, PromiseId, ResourceSpec, Returned, ScalingPolicy,
    SizedJob, TaskSpec, TwoPhase,
};
use crate::error::{FlowError, StoreError};
use crate::manifest::Manifest;
use crate::sink::CheckpointTarget;
use crate::store::{Access, BlobRef, BlobStore};
use crate::tools::{Invocation, ensure_output};

/// One line of a chrom file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromEntry {
    pub chrom: String,
    pub seq_file: String,
    pub alignments: String,
}

/// Parses a chrom file: one `chrom seqfile alignments` line per chromosome,
/// separated by whitespace. Blank lines are skipped.
pub fn parse_chrom_file(text: &str) -> Result<Vec<ChromEntry>, FlowError> {
    let mut entries: Vec<ChromEntry> = Vec::new();

    for (n, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            [chrom, seq_file, alignments] => {
                if entries.iter().any(|e| e.chrom == *chrom) {
                    return Err(FlowError::Parse {
                        line: n + 1,
                        message: format!("chromosome {chrom} listed twice"),
                    });
                }
                entries.push(ChromEntry {
                    chrom: chrom.to_string(),
                    seq_file: seq_file.to_string(),
                    alignments: alignments.to_string(),
                });
            }
            _ => {
                return Err(FlowError::Parse {
                    line: n + 1,
                    message: format!("expected 3 tokens, found {}", tokens.len()),
                });
            }
        }
    }

    Ok(entries)
}

pub fn read_chrom_file(path: &Utf8Path) -> Result<Vec<ChromEntry>, FlowError> {
    parse_chrom_file(&fs::read_to_string(path)?)
}

/// Parses per-chromosome core counts given as `chrom,cores`.
pub fn parse_cores_overrides<S: AsRef<str>>(items: &[S]) -> Result<BTreeMap<String, u32>, FlowError> {
    let mut overrides = BTreeMap::new();

    for (n, item) in items.iter().enumerate() {
        let item = item.as_ref();
        let parsed = item
            .split_once(',')
            .and_then(|(chrom, cores)| Some((chrom.trim(), cores.trim().parse::<u32>().ok()?)));

        match parsed {
            Some((chrom, cores)) if !chrom.is_empty() && cores > 0 => {
                overrides.insert(chrom.to_string(), cores);
            }
            _ => {
                return Err(FlowError::Parse {
                    line: n + 1,
                    message: format!("invalid core override {item:?}, expected chrom,cores"),
                });
            }
        }
    }

    Ok(overrides)
}

/// Flags for the HAL to vg conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hal2VgOptions {
    pub extra_args: Vec<String>,
    /// Keep the minigraph pseudo-assembly in the graph.
    pub include_minigraph: bool,
    /// Keep ancestral genomes in the graph.
    pub include_ancestor: bool,
    pub ancestor_event: String,
    /// Keep sequence names as they are instead of prefixing genome names.
    pub only_sequence_names: bool,
}

impl Default for Hal2VgOptions {
    fn default() -> Self {
        Self {
            extra_args: Vec::new(),
            include_minigraph: false,
            include_ancestor: false,
            ancestor_event: "Anc0".into(),
            only_sequence_names: true,
        }
    }
}

impl Hal2VgOptions {
    fn args(&self, hal: &Utf8Path, sentinel: &str) -> Vec<String> {
        let mut argv = vec!["hal2vg".to_string(), hal.to_string()];
        argv.extend(self.extra_args.iter().cloned());

        let ignored: Vec<&str> = [
            (!self.include_minigraph).then_some(sentinel),
            (!self.include_ancestor).then_some(self.ancestor_event.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !ignored.is_empty() {
            argv.push("--ignoreGenomes".into());
            argv.push(ignored.join(","));
        }

        if self.only_sequence_names {
            argv.push("--onlySequenceNames".into());
        }

        argv
    }
}

/// Settings of one alignment, shared by a batch and narrowed per chromosome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignOptions {
    /// Passed to `cactus-align` after the positional arguments.
    pub extra_args: Vec<String>,
    pub cores: u32,
    pub out_vg: bool,
    pub out_gfa: bool,
    /// Where outputs go as soon as they exist, bypassing the final export.
    /// For a batch this is a directory key, per chromosome the HAL key.
    pub checkpoint: Option<CheckpointTarget>,
    pub hal2vg: Hal2VgOptions,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            extra_args: Vec::new(),
            cores: 1,
            out_vg: false,
            out_gfa: false,
            checkpoint: None,
            hal2vg: Hal2VgOptions::default(),
        }
    }
}

impl AlignOptions {
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores.max(1);
        self
    }

    pub fn with_vg(mut self, vg: bool) -> Self {
        self.out_vg = vg;
        self
    }

    pub fn with_gfa(mut self, gfa: bool) -> Self {
        self.out_gfa = gfa;
        self
    }

    pub fn with_checkpoint(mut self, target: Option<CheckpointTarget>) -> Self {
        self.checkpoint = target;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_hal2vg(mut self, hal2vg: Hal2VgOptions) -> Self {
        self.hal2vg = hal2vg;
        self
    }

    /// The options for one chromosome of a batch: its own checkpoint key and
    /// core count, everything else shared.
    pub fn with_overrides(&self, chrom: &str, cores: &BTreeMap<String, u32>) -> Self {
        let checkpoint = self
            .checkpoint
            .as_ref()
            .map(|target| target.join(&format!("{chrom}.hal")));

        self.clone()
            .with_cores(cores.get(chrom).copied().unwrap_or(self.cores))
            .with_checkpoint(checkpoint)
    }

    fn exports(&self) -> bool {
        self.out_vg || self.out_gfa
    }
}

/// Inputs of one chromosome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignUnit {
    pub chrom: String,
    pub seq_file: BlobRef,
    pub alignments: BlobRef,
    /// `<alignments>.secondary`, when it exists next to the alignments.
    pub secondary: Option<BlobRef>,
}

/// Stores the inputs named by a chrom file.
pub fn import_units(
    store: &dyn BlobStore,
    entries: &[ChromEntry],
) -> Result<BTreeMap<String, AlignUnit>, FlowError> {
    let mut units = BTreeMap::new();

    for entry in entries {
        let secondary = format!("{}.secondary", entry.alignments);
        let unit = AlignUnit {
            chrom: entry.chrom.clone(),
            seq_file: store.put(Utf8Path::new(&entry.seq_file), None)?,
            alignments: store.put(Utf8Path::new(&entry.alignments), None)?,
            secondary: store.put_if_present(Utf8Path::new(&secondary), None)?,
        };
        units.insert(entry.chrom.clone(), unit);
    }

    Ok(units)
}

/// Everything one chromosome's alignment produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignOutput {
    pub hal: BlobRef,
    pub vg: Option<BlobRef>,
    pub gfa: Option<BlobRef>,
    pub log: BlobRef,
}

/// Root of a batch: one staggered [`AlignChrom`] per chromosome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignBatch {
    pub units: BTreeMap<String, AlignUnit>,
    pub options: AlignOptions,
    pub cores_overrides: BTreeMap<String, u32>,
}

impl Job for AlignBatch {
    type Output = BTreeMap<String, AlignOutput>;

    fn kind() -> Cow<'static, str> {
        "align-batch".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        if let Some(target) = &self.options.checkpoint
            && ctx.env.sink.is_none()
        {
            return Err(StoreError::NoSink(target.key.clone()).into());
        }

        let results = FanOut::new(ctx, "alignment")
            .staggered()
            .spawn(self.units.keys(), |chrom| {
                let options = self.options.with_overrides(chrom, &self.cores_overrides);
                let cpus = options.cores;
                TaskSpec::new(AlignChrom {
                    unit: self.units[chrom].clone(),
                    options,
                })
                .resources(ResourceSpec::new().cpus(cpus))
            })?;

        Ok(Returned::Forward(results))
    }
}

/// Aligns one chromosome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignChrom {
    pub unit: AlignUnit,
    pub options: AlignOptions,
}

impl Job for AlignChrom {
    type Output = AlignOutput;

    fn kind() -> Cow<'static, str> {
        "align-chrom".into()
    }

    fn name(&self) -> Cow<'static, str> {
        format!("align {}", self.unit.chrom).into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        let chrom = &self.unit.chrom;
        let seq_file = ctx.read_blob(&self.unit.seq_file, &format!("{chrom}_seq_file.txt"), Access::ReadOnly)?;
        let paf = ctx.read_blob(&self.unit.alignments, &format!("{chrom}.paf"), Access::ReadOnly)?;
        if let Some(secondary) = &self.unit.secondary {
            ctx.read_blob(secondary, &format!("{chrom}.paf.secondary"), Access::ReadOnly)?;
        }

        let js = ctx.work_dir().join("js");
        let hal = ctx.work_dir().join(format!("{chrom}.hal"));
        let log = ctx.work_dir().join(format!("{chrom}.hal.log"));

        let mut argv = vec![
            "cactus-align".to_string(),
            js.to_string(),
            seq_file.to_string(),
            paf.to_string(),
            hal.to_string(),
            "--logFile".into(),
            log.to_string(),
        ];
        argv.extend(self.options.extra_args.iter().cloned());

        let invocation = Invocation::new(argv).cwd(ctx.work_dir());
        ctx.run_tool(invocation.clone())?;
        ensure_output(&invocation, &hal)?;
        ensure_output(&invocation, &log)?;

        if let Some(target) = &self.options.checkpoint {
            ctx.checkpoint(&hal, target)?;
            ctx.checkpoint(&log, &target.with_suffix(".log"))?;
        }

        let hal_blob = ctx.write_blob(&hal)?;
        let log_blob = ctx.write_blob(&log)?;

        if !self.options.exports() {
            // cactus-align may have converted the graph itself.
            let vg = ctx.env.store.put_if_present(&hal.with_extension("vg"), Some(ctx.task_id()))?;
            let gfa = ctx
                .env
                .store
                .put_if_present(&hal.with_extension("gfa.gz"), Some(ctx.task_id()))?;

            return Ok(Returned::Value(AlignOutput {
                hal: hal_blob,
                vg,
                gfa,
                log: log_blob,
            }));
        }

        let export = ctx.add_child(TwoPhase::new(ExportVg {
            hal: Deferred::Ready(hal_blob.clone()),
            vg: self.options.out_vg,
            gfa: self.options.out_gfa,
            hal2vg: self.options.hal2vg.clone(),
            checkpoint: self.options.checkpoint.clone(),
        }))?;

        let package = ctx.add_follow_on(PackageAlignment {
            hal: hal_blob,
            log: log_blob,
            vg: export.slot(0),
            gfa: export.slot(1),
        })?;

        Ok(Returned::Forward(package.rv()))
    }
}

/// Converts a HAL alignment to vg, and optionally to gzipped GFA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportVg {
    pub hal: Deferred<BlobRef>,
    /// Keep the vg graph as an output.
    pub vg: bool,
    pub gfa: bool,
    pub hal2vg: Hal2VgOptions,
    /// HAL key in the durable sink; the graphs go next to it.
    pub checkpoint: Option<CheckpointTarget>,
}

impl SizedJob for ExportVg {
    fn sizing_inputs(&self) -> Vec<Deferred<BlobRef>> {
        vec![self.hal.clone()]
    }

    fn scaling(&self) -> ScalingPolicy {
        ScalingPolicy::disk(3).memory(10)
    }
}

impl Job for ExportVg {
    /// The vg and GFA graphs, each only when asked for.
    type Output = (Option<BlobRef>, Option<BlobRef>);

    fn kind() -> Cow<'static, str> {
        "export-vg".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        self.hal.promise_id().into_iter().collect()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        ctx.resources()?;

        let hal = ctx.read_blob(&self.hal.get(ctx)?, "out.hal", Access::ReadOnly)?;
        let vg = ctx.work_dir().join("out.vg");

        let argv = self.hal2vg.args(&hal, &ctx.config().sentinel_event);
        let invocation = Invocation::new(argv).stdout(&vg);
        ctx.run_tool(invocation.clone())?;
        ensure_output(&invocation, &vg)?;

        if let Some(target) = &self.checkpoint {
            ctx.checkpoint(&vg, &target.with_extension("vg"))?;
        }

        let mut gfa_blob = None;
        if self.gfa {
            let gfa = ctx.work_dir().join("out.gfa.gz");
            let invocation = Invocation::new(["vg", "view", "-g", vg.as_str()])
                .pipe(["gzip"])
                .stdout(&gfa);
            ctx.run_tool(invocation.clone())?;
            ensure_output(&invocation, &gfa)?;

            if let Some(target) = &self.checkpoint {
                ctx.checkpoint(&gfa, &target.with_extension("gfa.gz"))?;
            }
            gfa_blob = Some(ctx.write_blob(&gfa)?);
        }

        let vg_blob = match self.vg {
            true => Some(ctx.write_blob(&vg)?),
            false => None,
        };

        Ok(Returned::Value((vg_blob, gfa_blob)))
    }
}

/// Assembles the outputs of one chromosome once its graphs are exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageAlignment {
    pub hal: BlobRef,
    pub log: BlobRef,
    pub vg: Promise<Option<BlobRef>>,
    pub gfa: Promise<Option<BlobRef>>,
}

impl Job for PackageAlignment {
    type Output = AlignOutput;

    fn kind() -> Cow<'static, str> {
        "package-alignment".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        vec![self.vg.id(), self.gfa.id()]
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        Ok(Returned::Value(AlignOutput {
            hal: self.hal.clone(),
            vg: ctx.resolve(&self.vg)?,
            gfa: ctx.resolve(&self.gfa)?,
            log: self.log.clone(),
        }))
    }
}

/// Copies the alignments of a batch to `out_dir` and lists them in
/// `alignments.txt`.
///
/// Nothing is exported when the batch checkpointed to a durable sink, the
/// outputs are already there.
pub fn export_alignments(
    results: &BTreeMap<String, AlignOutput>,
    options: &AlignOptions,
    store: &dyn BlobStore,
    out_dir: &Utf8Path,
) -> Result<Option<Manifest>, FlowError> {
    if let Some(target) = &options.checkpoint {
        tracing::info!("alignments already checkpointed to {}", target.key);
        return Ok(None);
    }

    fs::create_dir_all(out_dir)?;
    let mut listing = Manifest::new();

    for (chrom, output) in results {
        let hal = out_dir.join(format!("{chrom}.hal"));
        store.get(&output.hal, &hal, Access::Mutable)?;
        store.get(&output.log, &out_dir.join(format!("{chrom}.hal.log")), Access::Mutable)?;

        if let Some(vg) = &output.vg {
            store.get(vg, &out_dir.join(format!("{chrom}.vg")), Access::Mutable)?;
        }
        if let Some(gfa) = &output.gfa {
            store.get(gfa, &out_dir.join(format!("{chrom}.gfa.gz")), Access::Mutable)?;
        }

        listing.insert(chrom.as_str(), hal.as_str());
    }

    listing.write(&out_dir.join("alignments.txt"))?;
    tracing::info!("exported {} alignments to {out_dir}", listing.len());
    Ok(Some(listing))
}
