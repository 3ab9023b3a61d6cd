//! Splitting a minigraph alignment into per-contig work units.
//!
//! The graph and its alignments are split by reference contig with
//! `rgfa-split`, then every input assembly is cut into per-contig slices.
//! The result is a [`WorkUnitTable`] keyed by contig, each unit carrying a
//! `gfa`, a `paf` and one `fa` slice per event.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::{
    Deferred, FallbackPolicy, FanOut, Job, JobContext, Promise, PromiseId, ResourceSpec,
    Returned, ScalingPolicy, SizedJob, TaskSpec, TwoPhase, WorkUnitTable, check_keys,
};
use crate::error::{FlowError, StoreError};
use crate::manifest::Manifest;
use crate::store::{Access, BlobRef, BlobStore};
use crate::tools::{Invocation, ensure_output};

/// Extensions `rgfa-split` writes for every contig.
const PARTS: [&str; 3] = ["gfa", "paf", "fa_contigs"];

/// An input file as it was given, together with its stored copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedBlob {
    /// Original file name, used to recognize compressed inputs.
    pub name: String,
    pub blob: BlobRef,
}

impl NamedBlob {
    pub fn is_gz(&self) -> bool {
        self.name.ends_with(".gz")
    }

    /// File name without its directory, and without `.gz` if compressed.
    fn local_name(&self) -> &str {
        let name = Utf8Path::new(&self.name).file_name().unwrap_or("input");
        name.strip_suffix(".gz").unwrap_or(name)
    }
}

/// Per-contig outputs of the graph split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContigParts {
    pub gfa: BlobRef,
    pub paf: BlobRef,
    /// Names of the input contigs assigned to this reference contig.
    pub fa_contigs: BlobRef,
}

/// Root of the split workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphmapSplit {
    pub gfa: NamedBlob,
    pub paf: NamedBlob,
    pub sequences: BTreeMap<String, NamedBlob>,
    pub ref_contigs: BTreeSet<String>,
}

impl GraphmapSplit {
    /// Stores the workflow inputs and builds the root job.
    ///
    /// A sequence path naming a directory stands for the concatenation of
    /// the files inside it, in name order.
    pub fn import(
        store: &dyn BlobStore,
        scratch: &Utf8Path,
        gfa: &Utf8Path,
        paf: &Utf8Path,
        sequences: &Manifest,
        ref_contigs: impl IntoIterator<Item = String>,
    ) -> Result<Self, FlowError> {
        let mut imported = BTreeMap::new();

        for (event, location) in sequences.iter() {
            let path = Utf8Path::new(location);
            let named = if path.is_dir() {
                fs::create_dir_all(scratch)?;
                let joined = scratch.join(format!("{event}.fa"));
                concatenate(path, &joined)?;
                import_file(store, &joined)?
            } else {
                import_file(store, path)?
            };
            imported.insert(event.to_string(), named);
        }

        Ok(Self {
            gfa: import_file(store, gfa)?,
            paf: import_file(store, paf)?,
            sequences: imported,
            ref_contigs: ref_contigs.into_iter().collect(),
        })
    }

    /// A gzip-compressed input is decompressed by a child task, anything
    /// else is used as is.
    fn plain(&self, ctx: &mut JobContext<'_>, input: &NamedBlob) -> Result<Deferred<BlobRef>, FlowError> {
        if !input.is_gz() {
            return Ok(Deferred::Ready(input.blob.clone()));
        }

        let disk = input.blob.size_bytes.saturating_mul(10);
        let spec = TaskSpec::new(Gunzip {
            input: input.clone(),
        })
        .resources(ResourceSpec::new().cpus(1).disk(disk));

        Ok(ctx.add_child(spec)?.rv().into())
    }
}

impl Job for GraphmapSplit {
    type Output = WorkUnitTable;

    fn kind() -> Cow<'static, str> {
        "graphmap-split".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        let sentinel = &ctx.config().sentinel_event;
        if !self.sequences.contains_key(sentinel) {
            return Err(FlowError::MissingKey {
                stage: "sequence map".into(),
                key: sentinel.clone(),
            }
            .into());
        }

        let gfa = self.plain(ctx, &self.gfa)?;
        let paf = self.plain(ctx, &self.paf)?;

        let graph = ctx.add_follow_on(TwoPhase::new(SplitGraph {
            gfa,
            paf,
            ref_contigs: self.ref_contigs.clone(),
        }))?;

        let slices = ctx.follow_on_of(
            graph.id(),
            SplitFastas {
                sequences: self.sequences.clone(),
                split: graph.rv(),
            },
        )?;

        let gather = ctx.follow_on_of(
            slices.id(),
            GatherFastas {
                sequences: self.sequences.clone(),
                split: graph.rv(),
                slices: slices.rv(),
            },
        )?;

        Ok(Returned::Forward(gather.rv()))
    }
}

/// Decompresses one gzip input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gunzip {
    pub input: NamedBlob,
}

impl Job for Gunzip {
    type Output = BlobRef;

    fn kind() -> Cow<'static, str> {
        "gunzip".into()
    }

    fn name(&self) -> Cow<'static, str> {
        format!("gunzip {}", self.input.name).into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        let name = self.input.local_name();
        let packed = ctx.read_blob(&self.input.blob, &format!("{name}.gz"), Access::ReadOnly)?;
        let plain = ctx.work_dir().join(name);

        let invocation = Invocation::new(["gzip", "-dc", packed.as_str()]).stdout(&plain);
        ctx.run_tool(invocation.clone())?;
        ensure_output(&invocation, &plain)?;

        Ok(Returned::Value(ctx.write_blob(&plain)?))
    }
}

/// Splits the graph and its alignments by reference contig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitGraph {
    pub gfa: Deferred<BlobRef>,
    pub paf: Deferred<BlobRef>,
    /// Restricts the split to these contigs when not empty.
    pub ref_contigs: BTreeSet<String>,
}

impl SizedJob for SplitGraph {
    fn sizing_inputs(&self) -> Vec<Deferred<BlobRef>> {
        vec![self.gfa.clone(), self.paf.clone()]
    }

    fn scaling(&self) -> ScalingPolicy {
        ScalingPolicy::disk(5)
    }
}

impl Job for SplitGraph {
    type Output = BTreeMap<String, ContigParts>;

    fn kind() -> Cow<'static, str> {
        "split-graph".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        [&self.gfa, &self.paf]
            .into_iter()
            .filter_map(Deferred::promise_id)
            .collect()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        ctx.resources()?;

        let gfa = ctx.read_blob(&self.gfa.get(ctx)?, "mg.gfa", Access::ReadOnly)?;
        let paf = ctx.read_blob(&self.paf.get(ctx)?, "mg.paf", Access::ReadOnly)?;

        let out = ctx.work_dir().join("output");
        fs::create_dir_all(&out)?;

        let mut argv = vec![
            "rgfa-split".to_string(),
            "-g".into(),
            gfa.to_string(),
            "-p".into(),
            paf.to_string(),
            "-b".into(),
            format!("{out}/"),
        ];
        for contig in &self.ref_contigs {
            argv.push("-c".into());
            argv.push(contig.clone());
        }
        ctx.run_tool(Invocation::new(argv))?;

        let mut found: BTreeMap<String, BTreeMap<String, BlobRef>> = BTreeMap::new();
        for entry in glob::glob(&format!("{}/*", glob::Pattern::escape(out.as_str())))? {
            let path = Utf8PathBuf::try_from(entry?)?;
            let (Some(stem), Some(ext)) = (path.file_stem(), path.extension()) else {
                continue;
            };
            if !PARTS.contains(&ext) {
                tracing::debug!("ignoring split output {path}");
                continue;
            }

            let blob = ctx.write_blob(&path)?;
            found
                .entry(stem.to_string())
                .or_default()
                .insert(ext.to_string(), blob);
        }

        let mut parts = BTreeMap::new();
        for (contig, mut files) in found {
            let mut take = |ext: &str| {
                files.remove(ext).ok_or_else(|| FlowError::MissingKey {
                    stage: "graph split".into(),
                    key: format!("{contig}.{ext}"),
                })
            };
            let unit = ContigParts {
                gfa: take("gfa")?,
                paf: take("paf")?,
                fa_contigs: take("fa_contigs")?,
            };
            parts.insert(contig, unit);
        }

        tracing::info!("split graph into {} contigs", parts.len());
        Ok(Returned::Value(parts))
    }
}

/// Fans out one [`SplitFasta`] per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitFastas {
    pub sequences: BTreeMap<String, NamedBlob>,
    pub split: Promise<BTreeMap<String, ContigParts>>,
}

impl Job for SplitFastas {
    type Output = BTreeMap<String, BTreeMap<String, Option<BlobRef>>>;

    fn kind() -> Cow<'static, str> {
        "split-fastas".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        let by_name = ctx.config().event_name_as_id;
        let ids: BTreeMap<&str, usize> = self
            .sequences
            .keys()
            .enumerate()
            .map(|(n, event)| (event.as_str(), n))
            .collect();

        let slices = FanOut::new(ctx, "sequence split").spawn(self.sequences.keys(), |event| {
            let prefix = match (by_name, ids.get(event)) {
                (true, _) | (false, None) => format!("id={event}|"),
                (false, Some(n)) => format!("id={n}|"),
            };
            TaskSpec::new(TwoPhase::new(SplitFasta {
                event: event.to_string(),
                fasta: self.sequences[event].clone(),
                prefix,
                split: self.split,
            }))
        })?;

        Ok(Returned::Forward(slices))
    }
}

/// Cuts one assembly into per-contig slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitFasta {
    pub event: String,
    pub fasta: NamedBlob,
    /// Unique-id prefix of this event's sequence names in the graph.
    pub prefix: String,
    pub split: Promise<BTreeMap<String, ContigParts>>,
}

impl SizedJob for SplitFasta {
    fn sizing_inputs(&self) -> Vec<Deferred<BlobRef>> {
        vec![Deferred::Ready(self.fasta.blob.clone())]
    }

    fn scaling(&self) -> ScalingPolicy {
        ScalingPolicy::disk(3)
    }
}

impl Job for SplitFasta {
    /// Slice per contig, `None` when the event has no sequence on it.
    type Output = BTreeMap<String, Option<BlobRef>>;

    fn kind() -> Cow<'static, str> {
        "split-fasta".into()
    }

    fn name(&self) -> Cow<'static, str> {
        format!("split {}", self.event).into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        vec![self.split.id()]
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        ctx.resources()?;
        let split = ctx.resolve(&self.split)?;

        let fasta = if self.fasta.is_gz() {
            let local = self.fasta.local_name();
            let packed = ctx.read_blob(&self.fasta.blob, &format!("{local}.gz"), Access::Mutable)?;
            let invocation = Invocation::new(["gzip", "-fd", packed.as_str()]);
            let plain = ctx.work_dir().join(local);
            ctx.run_tool(invocation.clone())?;
            ensure_output(&invocation, &plain)?;
            plain
        } else {
            ctx.read_blob(&self.fasta.blob, self.fasta.local_name(), Access::ReadOnly)?
        };

        let mut slices = BTreeMap::new();
        for (contig, parts) in &split {
            let listed = ctx.read_blob(&parts.fa_contigs, &format!("{contig}.fa_contigs"), Access::ReadOnly)?;
            let names = fs::read_to_string(&listed).with_context(|| format!("reading {listed}"))?;

            let mine: Vec<&str> = names
                .lines()
                .filter_map(|line| line.trim().strip_prefix(&self.prefix))
                .collect();

            if mine.is_empty() {
                tracing::debug!("{} has no sequence on {contig}", self.event);
                slices.insert(contig.clone(), None);
                continue;
            }

            let clean = ctx.work_dir().join(format!("{contig}.fa_contigs.clean"));
            fs::write(&clean, mine.join("\n") + "\n")?;

            let out = ctx.work_dir().join(format!("{}_{contig}.fa", self.event));
            let invocation = Invocation::new([
                "samtools",
                "faidx",
                fasta.as_str(),
                "--region-file",
                clean.as_str(),
            ])
            .stdout(&out);
            ctx.run_tool(invocation.clone())?;
            ensure_output(&invocation, &out)?;

            slices.insert(contig.clone(), Some(ctx.write_blob(&out)?));
        }

        Ok(Returned::Value(slices))
    }
}

/// Joins graph and sequence splits into the final table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherFastas {
    pub sequences: BTreeMap<String, NamedBlob>,
    pub split: Promise<BTreeMap<String, ContigParts>>,
    pub slices: Promise<BTreeMap<String, BTreeMap<String, Option<BlobRef>>>>,
}

impl Job for GatherFastas {
    type Output = WorkUnitTable;

    fn kind() -> Cow<'static, str> {
        "gather-fastas".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        vec![self.split.id(), self.slices.id()]
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        let split = ctx.resolve(&self.split)?;
        let slices = ctx.resolve(&self.slices)?;
        let policy = FallbackPolicy::new(ctx.config().sentinel_event.clone());

        check_keys("sequence split", self.sequences.keys(), slices.keys())?;

        let mut table = WorkUnitTable::with_keys(split.keys().cloned());
        let gfa = split.iter().map(|(k, p)| (k.clone(), p.gfa.clone())).collect();
        let paf = split.iter().map(|(k, p)| (k.clone(), p.paf.clone())).collect();
        table.merge_blobs("graph split", "gfa", gfa)?;
        table.merge_blobs("graph split", "paf", paf)?;

        let mut fa = BTreeMap::new();
        for contig in split.keys() {
            let mut per_event = BTreeMap::new();
            for (event, per_contig) in &slices {
                let found = per_contig.get(contig).ok_or_else(|| FlowError::MissingKey {
                    stage: format!("sequence split of {event}"),
                    key: contig.clone(),
                })?;
                let original = &self.sequences[event].blob;
                let blob = policy.resolve(event, contig, found.clone(), original)?;
                per_event.insert(event.clone(), blob);
            }
            fa.insert(contig.clone(), per_event);
        }
        table.merge_nested("sequence split", "fa", fa)?;

        Ok(Returned::Value(table))
    }
}

/// Writes the split out under `out_dir` and returns the chrom manifest, also
/// saved as `chromfile.txt`.
///
/// Every contig gets its own directory with the graph, the alignments, the
/// sequence slices under `fasta/` and a `<contig>.seqfile` manifest.
pub fn export_split(
    table: &WorkUnitTable,
    store: &dyn BlobStore,
    out_dir: &Utf8Path,
) -> Result<Manifest, FlowError> {
    fs::create_dir_all(out_dir)?;
    let out_dir = out_dir.canonicalize_utf8()?;
    let mut chroms = Manifest::new();

    for unit in table.iter() {
        let contig = &unit.name;
        let dir = out_dir.join(contig);
        fs::create_dir_all(dir.join("fasta"))?;

        for ext in ["gfa", "paf"] {
            let blob = unit.blob(ext).ok_or_else(|| FlowError::MissingKey {
                stage: "export".into(),
                key: format!("{contig}.{ext}"),
            })?;
            store.get(blob, &dir.join(format!("{contig}.{ext}")), Access::Mutable)?;
        }

        let slices = unit.nested("fa").ok_or_else(|| FlowError::MissingKey {
            stage: "export".into(),
            key: format!("{contig}.fa"),
        })?;

        let mut seqfile = Manifest::new();
        for (event, blob) in slices {
            let path = dir.join("fasta").join(format!("{event}_{contig}.fa"));
            store.get(blob, &path, Access::Mutable)?;
            seqfile.insert(event.as_str(), path.as_str());
        }

        let seqfile_path = dir.join(format!("{contig}.seqfile"));
        seqfile.write(&seqfile_path)?;
        chroms.insert(contig.as_str(), seqfile_path.as_str());
    }

    chroms.write(&out_dir.join("chromfile.txt"))?;
    tracing::info!("exported {} contigs to {out_dir}", chroms.len());
    Ok(chroms)
}

/// Reference contigs from an explicit list plus an optional file holding one
/// name per line, extra columns ignored.
pub fn read_ref_contigs(
    listed: &[String],
    file: Option<&Utf8Path>,
) -> Result<BTreeSet<String>, FlowError> {
    let mut contigs: BTreeSet<String> = listed.iter().cloned().collect();

    if let Some(file) = file {
        let text = fs::read_to_string(file)?;
        contigs.extend(
            text.lines()
                .filter_map(|line| line.split_whitespace().next())
                .map(str::to_string),
        );
    }

    Ok(contigs)
}

fn import_file(store: &dyn BlobStore, path: &Utf8Path) -> Result<NamedBlob, StoreError> {
    Ok(NamedBlob {
        name: path.file_name().unwrap_or(path.as_str()).to_string(),
        blob: store.put(path, None)?,
    })
}

fn concatenate(dir: &Utf8Path, into: &Utf8Path) -> Result<(), FlowError> {
    let mut files: Vec<Utf8PathBuf> = dir
        .read_dir_utf8()?
        .map(|entry| entry.map(|e| e.into_path()))
        .collect::<Result<_, _>>()?;
    files.retain(|path| path.is_file());
    files.sort();

    let mut out = fs::File::create(into)?;
    for file in files {
        let mut input = fs::File::open(&file)?;
        std::io::copy(&mut input, &mut out)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskState;
    use crate::testing::{harness, split_fixture};

    #[test]
    fn test_split_covers_every_contig_with_sentinel_fallback() {
        let h = harness();
        let job = split_fixture(&h, &["chr1", "chr2", "chrX"]);
        let minigraph = job.sequences["_MINIGRAPH_"].blob.clone();

        let (mut wf, root) = h.workflow(job);
        wf.run().unwrap();

        let table = wf.resolve(&root.rv()).unwrap();
        assert_eq!(table.keys().collect::<Vec<_>>(), ["chr1", "chr2", "chrX"]);

        for unit in table.iter() {
            assert!(unit.blob("gfa").is_some());
            assert!(unit.blob("paf").is_some());
            let fa = unit.nested("fa").unwrap();
            assert_eq!(fa.keys().collect::<Vec<_>>(), ["CHM13", "_MINIGRAPH_", "hg38"]);
        }

        // The minigraph has no sequence on chrX: its whole input stands in.
        assert_eq!(wf.state(wf.root()), Some(TaskState::Succeeded));
        let chr_x = table.get("chrX").unwrap().nested("fa").unwrap();
        let chr_1 = table.get("chr1").unwrap().nested("fa").unwrap();
        assert_eq!(chr_x["_MINIGRAPH_"], minigraph);
        assert_ne!(chr_1["_MINIGRAPH_"], minigraph);
        assert_ne!(chr_x["hg38"], minigraph);
    }

    #[test]
    fn test_work_dir_with_glob_characters() {
        let h = harness();
        let job = split_fixture(&h, &["chr1", "chr2"]);

        let (mut wf, root) =
            crate::Workflow::create(h.root.join("run[1]*"), h.env.clone(), job).unwrap();
        wf.run().unwrap();

        let table = wf.resolve(&root.rv()).unwrap();
        assert_eq!(table.keys().collect::<Vec<_>>(), ["chr1", "chr2"]);
        assert!(table.get("chr2").unwrap().blob("gfa").is_some());
    }

    #[test]
    fn test_missing_slice_of_regular_event_fails() {
        let h = harness();
        // hg38 has nothing on chrX here.
        h.tools.omit_sequence("hg38", "chrX");
        let job = split_fixture(&h, &["chr1", "chrX"]);

        let (mut wf, _) = h.workflow(job);
        let FlowError::Failed(failure) = wf.run().unwrap_err() else {
            panic!("expected a run failure");
        };
        assert_eq!(failure.failures.len(), 1);
        assert!(failure.failures[0].message.contains("chrX"));
        assert!(failure.failures[0].message.contains("hg38"));
    }

    #[test]
    fn test_sentinel_must_be_in_sequence_map() {
        let h = harness();
        let mut job = split_fixture(&h, &["chr1"]);
        job.sequences.remove("_MINIGRAPH_");

        let (mut wf, _) = h.workflow(job);
        let FlowError::Failed(failure) = wf.run().unwrap_err() else {
            panic!("expected a run failure");
        };
        assert!(failure.failures[0].message.contains("_MINIGRAPH_"));
        assert_eq!(wf.tasks().count(), 1);
    }

    #[test]
    fn test_compressed_inputs_are_unpacked_first() {
        let h = harness();
        let mut job = split_fixture(&h, &["chr1"]);
        job.gfa = h.compressed(&job.gfa);
        let hg38 = h.compressed(&job.sequences["hg38"]);
        job.sequences.insert("hg38".into(), hg38);

        let (mut wf, root) = h.workflow(job);
        wf.run().unwrap();

        let table = wf.resolve(&root.rv()).unwrap();
        assert!(table.get("chr1").unwrap().nested("fa").unwrap()["hg38"].size_bytes > 0);

        let calls = h.tools.calls();
        assert!(calls.iter().any(|c| c.starts_with("gzip -dc")));
        assert!(calls.iter().any(|c| c.starts_with("gzip -fd")));

        let gunzip = wf.tasks().find(|t| t.kind == "gunzip").unwrap();
        assert!(gunzip.resources.unwrap().disk_bytes > 0);
    }

    #[test]
    fn test_prefix_follows_event_name_setting() {
        let h = harness();
        let job = split_fixture(&h, &["chr1"]);
        let env = h
            .env
            .clone()
            .with_config(h.env.config.clone().with_event_name_as_id(true));
        h.tools.use_event_names();

        let (mut wf, root) =
            crate::Workflow::create(h.root.join("named"), env, job).unwrap();
        wf.run().unwrap();
        assert_eq!(wf.resolve(&root.rv()).unwrap().len(), 1);
    }

    #[test]
    fn test_export_layout() {
        let h = harness();
        let job = split_fixture(&h, &["chr1", "chr2"]);
        let (mut wf, root) = h.workflow(job);
        wf.run().unwrap();
        let table = wf.resolve(&root.rv()).unwrap();

        let out = h.root.join("split");
        let chroms = export_split(&table, h.env.store.as_ref(), &out).unwrap();

        assert_eq!(chroms.len(), 2);
        let out = out.canonicalize_utf8().unwrap();
        assert_eq!(
            Manifest::read(&out.join("chromfile.txt")).unwrap(),
            chroms
        );
        assert!(out.join("chr1/chr1.gfa").is_file());
        assert!(out.join("chr1/chr1.paf").is_file());
        assert!(out.join("chr2/fasta/hg38_chr2.fa").is_file());

        let seqfile = Manifest::read(&out.join("chr1/chr1.seqfile")).unwrap();
        assert_eq!(
            seqfile.get("CHM13"),
            Some(out.join("chr1/fasta/CHM13_chr1.fa").as_str())
        );
        assert_eq!(chroms.get("chr2"), Some(out.join("chr2/chr2.seqfile").as_str()));
    }

    #[test]
    fn test_ref_contigs_from_list_and_file() {
        let h = harness();
        let file = h.root.join("contigs.txt");
        fs::write(&file, "chr2 extra\n\nchr3\n").unwrap();

        let contigs = read_ref_contigs(&["chr1".into()], Some(&file)).unwrap();
        assert_eq!(contigs.into_iter().collect::<Vec<_>>(), ["chr1", "chr2", "chr3"]);
    }

    #[test]
    fn test_directory_input_is_concatenated() {
        let h = harness();
        let dir = h.root.join("parts");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.fa"), ">b\nCC\n").unwrap();
        fs::write(dir.join("a.fa"), ">a\nGG\n").unwrap();
        fs::write(h.root.join("mg.gfa"), "S\t1\tA\n").unwrap();
        fs::write(h.root.join("mg.paf"), "").unwrap();

        let seqs = Manifest::from_iter([("hg38".to_string(), dir.to_string())]);
        let job = GraphmapSplit::import(
            h.env.store.as_ref(),
            &h.root.join("scratch"),
            &h.root.join("mg.gfa"),
            &h.root.join("mg.paf"),
            &seqs,
            Vec::new(),
        )
        .unwrap();

        let local = h.root.join("joined.fa");
        h.env
            .store
            .get(&job.sequences["hg38"].blob, &local, Access::ReadOnly)
            .unwrap();
        assert_eq!(fs::read_to_string(local).unwrap(), ">a\nGG\n>b\nCC\n");
    }
}
