//! Shared fixtures for tests: a scratch workflow harness, small jobs that
//! exercise the engine and a scripted stand-in for the external tools.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::core::{Environment, FlowConfig};
use crate::engine::{
    Deferred, IntoTaskSpec, Job, JobContext, Promise, PromiseId, Registry, Returned,
    ScalingPolicy, SizedJob, TaskRef, TwoPhase,
};
use crate::error::ToolError;
use crate::manifest::Manifest;
use crate::pipeline::align::{AlignUnit, import_units, parse_chrom_file};
use crate::pipeline::split::{GraphmapSplit, NamedBlob};
use crate::store::{Access, BlobId, BlobRef, LocalBlobStore};
use crate::tools::{Invocation, ToolRunner};
use crate::workflow::Workflow;

pub fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

pub struct Harness {
    _dir: TempDir,
    pub root: Utf8PathBuf,
    pub env: Environment,
    pub tools: Arc<FakeTools>,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = utf8(dir.path());
    let store = LocalBlobStore::open(root.join("store")).unwrap();
    let tools = Arc::new(FakeTools::default());

    let env = Environment::new(
        FlowConfig::default().with_workers(4),
        Arc::new(store),
        tools.clone(),
    );

    Harness {
        _dir: dir,
        root,
        env,
        tools,
    }
}

impl Harness {
    pub fn workflow<S: IntoTaskSpec>(&self, root: S) -> (Workflow, TaskRef<<S::Job as Job>::Output>) {
        Workflow::create(self.root.join("wf"), self.env.clone(), root).unwrap()
    }

    pub fn input(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.root.join("inputs").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// A gzip-compressed copy of an input, in the format [`FakeTools`]
    /// understands.
    pub fn compressed(&self, named: &NamedBlob) -> NamedBlob {
        let plain = self.root.join("inputs").join(format!("{}.plain", named.name));
        self.env.store.get(&named.blob, &plain, Access::ReadOnly).unwrap();
        let text = fs::read_to_string(&plain).unwrap();

        let name = format!("{}.gz", named.name);
        let path = self.input(&name, &format!("gz:{text}"));
        NamedBlob {
            name,
            blob: self.env.store.put(&path, None).unwrap(),
        }
    }
}

/// Events of the split fixture, in id order.
pub const EVENTS: [&str; 3] = ["CHM13", "_MINIGRAPH_", "hg38"];

/// A split workflow over `contigs`. The minigraph has no sequence on `chrX`.
pub fn split_fixture(h: &Harness, contigs: &[&str]) -> GraphmapSplit {
    h.tools.set_split(contigs, &EVENTS);
    if contigs.contains(&"chrX") {
        h.tools.omit_sequence("_MINIGRAPH_", "chrX");
    }

    let gfa = h.input("mg.gfa", "H\tVN:Z:1.0\n");
    let paf = h.input("mg.paf", "");

    let mut sequences = Manifest::new();
    for event in EVENTS {
        let records: String = contigs
            .iter()
            .map(|contig| format!(">{event}.{contig}\nACGT{}\n", event.len() * contig.len()))
            .collect();
        let path = h.input(&format!("{event}.fa"), &records);
        sequences.insert(event, path.as_str());
    }

    GraphmapSplit::import(
        h.env.store.as_ref(),
        &h.root.join("scratch"),
        &gfa,
        &paf,
        &sequences,
        Vec::new(),
    )
    .unwrap()
}

/// Alignment inputs for `chroms`.
pub fn align_fixture(h: &Harness, chroms: &[&str]) -> BTreeMap<String, AlignUnit> {
    let lines: String = chroms
        .iter()
        .map(|chrom| {
            let seq = h.input(&format!("{chrom}.seqfile"), &format!("hg38\t{chrom}.fa\n"));
            let paf = h.input(&format!("{chrom}.paf"), &format!("{chrom}\t100\n"));
            format!("{chrom} {seq} {paf}\n")
        })
        .collect();

    let entries = parse_chrom_file(&lines).unwrap();
    import_units(h.env.store.as_ref(), &entries).unwrap()
}

/// Registry with every test job.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register::<Emit>()
        .register::<Add>()
        .register::<Sum>()
        .register::<Tree>()
        .register::<Peek>()
        .register::<Fail>()
        .register::<Tool>()
        .register::<StoreText>()
        .register::<TwoPhase<Measure>>();
    registry
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emit {
    pub value: u64,
}

impl Job for Emit {
    type Output = u64;

    fn kind() -> Cow<'static, str> {
        "emit".into()
    }

    fn run(&self, _: &mut JobContext<'_>) -> anyhow::Result<Returned<u64>> {
        Ok(Returned::Value(self.value))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Add {
    pub a: Promise<u64>,
    pub b: Promise<u64>,
}

impl Job for Add {
    type Output = u64;

    fn kind() -> Cow<'static, str> {
        "add".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        vec![self.a.id(), self.b.id()]
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<u64>> {
        Ok(Returned::Value(ctx.resolve(&self.a)? + ctx.resolve(&self.b)?))
    }
}

/// Emits both numbers from children and forwards their sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sum {
    pub a: u64,
    pub b: u64,
}

impl Job for Sum {
    type Output = u64;

    fn kind() -> Cow<'static, str> {
        "sum".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<u64>> {
        let a = ctx.add_child(Emit { value: self.a })?;
        let b = ctx.add_child(Emit { value: self.b })?;
        let sum = ctx.add_follow_on(Add { a: a.rv(), b: b.rv() })?;
        Ok(Returned::Forward(sum.rv()))
    }
}

/// Sleeps, then spawns `width` subtrees one level shallower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub depth: u32,
    pub width: u32,
    pub ms: u64,
}

impl Job for Tree {
    type Output = u32;

    fn kind() -> Cow<'static, str> {
        "tree".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<u32>> {
        thread::sleep(Duration::from_millis(self.ms));
        if self.depth > 0 {
            for _ in 0..self.width {
                ctx.add_child(Tree {
                    depth: self.depth - 1,
                    ..*self
                })?;
            }
        }
        Ok(Returned::Value(self.depth))
    }
}

/// Reads a promise, declared as an input or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peek {
    pub promise: Promise<u64>,
    pub declared: bool,
}

impl Job for Peek {
    type Output = u64;

    fn kind() -> Cow<'static, str> {
        "peek".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        match self.declared {
            true => vec![self.promise.id()],
            false => Vec::new(),
        }
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<u64>> {
        Ok(Returned::Value(ctx.resolve(&self.promise)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    pub panic: bool,
}

impl Job for Fail {
    type Output = ();

    fn kind() -> Cow<'static, str> {
        "fail".into()
    }

    fn run(&self, _: &mut JobContext<'_>) -> anyhow::Result<Returned<()>> {
        if self.panic {
            panic!("boom");
        }
        anyhow::bail!("deliberate failure")
    }
}

/// Runs one external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub argv: Vec<String>,
}

impl Job for Tool {
    type Output = ();

    fn kind() -> Cow<'static, str> {
        "tool".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<()>> {
        ctx.run_tool(Invocation::new(self.argv.clone()))?;
        Ok(Returned::Value(()))
    }
}

/// Stores `contents` as a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreText {
    pub contents: String,
}

impl Job for StoreText {
    type Output = BlobRef;

    fn kind() -> Cow<'static, str> {
        "write".into()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<BlobRef>> {
        let path = ctx.work_dir().join("out.txt");
        fs::write(&path, &self.contents)?;
        Ok(Returned::Value(ctx.write_blob(&path)?))
    }
}

/// Reports the disk it was given, three times the size of its blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    pub blob: Deferred<BlobRef>,
}

impl Measure {
    pub fn of(blob: BlobRef) -> Self {
        Self {
            blob: Deferred::Ready(blob),
        }
    }

    /// A measure of a blob that only exists as a reference.
    pub fn ready_blob_of(size_bytes: u64) -> Self {
        Self::of(BlobRef {
            id: BlobId("0".repeat(64)),
            size_bytes,
            origin: None,
        })
    }
}

impl SizedJob for Measure {
    fn sizing_inputs(&self) -> Vec<Deferred<BlobRef>> {
        vec![self.blob.clone()]
    }

    fn scaling(&self) -> ScalingPolicy {
        ScalingPolicy::disk(3)
    }
}

impl Job for Measure {
    type Output = u64;

    fn kind() -> Cow<'static, str> {
        "measure".into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        self.blob.promise_id().into_iter().collect()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<u64>> {
        Ok(Returned::Value(ctx.resources()?.disk_bytes))
    }
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<(String, String)>,
    failures: Vec<(String, String)>,
    contigs: Vec<String>,
    events: Vec<String>,
    omitted: BTreeSet<(String, String)>,
    by_name: bool,
}

/// A [`ToolRunner`] that fakes the pipeline tools on small text files.
///
/// Compressed files are plain text behind a `gz:` marker. Every call is
/// recorded, and calls can be made to fail with exit status 3.
#[derive(Debug, Default)]
pub struct FakeTools {
    script: Mutex<Script>,
}

impl FakeTools {
    /// Every invocation so far, rendered as a command line.
    pub fn calls(&self) -> Vec<String> {
        let script = self.script.lock().unwrap();
        script.calls.iter().map(|(_, line)| line.clone()).collect()
    }

    pub fn count(&self, program: &str) -> usize {
        let script = self.script.lock().unwrap();
        script.calls.iter().filter(|(p, _)| p == program).count()
    }

    /// Makes `program` fail whenever its command line contains `needle`.
    pub fn fail_when(&self, program: &str, needle: &str) {
        let mut script = self.script.lock().unwrap();
        script.failures.push((program.into(), needle.into()));
    }

    pub fn clear_failures(&self) {
        self.script.lock().unwrap().failures.clear();
    }

    /// Contigs `rgfa-split` reports and events it assigns sequences to.
    pub fn set_split(&self, contigs: &[&str], events: &[&str]) {
        let mut script = self.script.lock().unwrap();
        script.contigs = contigs.iter().map(|c| c.to_string()).collect();
        script.events = events.iter().map(|e| e.to_string()).collect();
    }

    /// Leaves `event` without sequence on `contig`.
    pub fn omit_sequence(&self, event: &str, contig: &str) {
        let mut script = self.script.lock().unwrap();
        script.omitted.insert((event.into(), contig.into()));
    }

    /// Prefixes sequence names with event names rather than indices.
    pub fn use_event_names(&self) {
        self.script.lock().unwrap().by_name = true;
    }

    fn rgfa_split(&self, argv: &[String]) -> std::io::Result<()> {
        let script = self.script.lock().unwrap();
        let value = |flag: &str| {
            argv.iter()
                .position(|a| a == flag)
                .and_then(|i| argv.get(i + 1))
        };
        let base = value("-b").cloned().unwrap_or_default();

        let selected: Vec<&String> = argv
            .windows(2)
            .filter(|w| w[0] == "-c")
            .map(|w| &w[1])
            .collect();

        for contig in &script.contigs {
            if !selected.is_empty() && !selected.contains(&contig) {
                continue;
            }

            let listed: String = script
                .events
                .iter()
                .enumerate()
                .filter(|(_, event)| !script.omitted.contains(&((*event).clone(), contig.clone())))
                .map(|(n, event)| match script.by_name {
                    true => format!("id={event}|{event}.{contig}\n"),
                    false => format!("id={n}|{event}.{contig}\n"),
                })
                .collect();

            fs::write(format!("{base}{contig}.gfa"), format!("S\t{contig}\n"))?;
            fs::write(format!("{base}{contig}.paf"), format!("{contig}\tpaf\n"))?;
            fs::write(format!("{base}{contig}.fa_contigs"), listed)?;
        }

        Ok(())
    }
}

impl ToolRunner for FakeTools {
    fn run(&self, invocation: &Invocation) -> Result<(), ToolError> {
        let command = invocation.display();
        let program = invocation.program().to_string();

        {
            let mut script = self.script.lock().unwrap();
            script.calls.push((program.clone(), command.clone()));
            if script
                .failures
                .iter()
                .any(|(p, needle)| *p == program && command.contains(needle.as_str()))
            {
                return Err(ToolError::Exit { command, code: 3 });
            }
        }

        let argv = &invocation.commands[0];
        let arg = |i: usize| Utf8Path::new(argv.get(i).map(String::as_str).unwrap_or_default());
        let read = |path: &Utf8Path| fs::read_to_string(path);
        let unpack = |text: String| text.strip_prefix("gz:").map(str::to_string).unwrap_or(text);

        let output = match program.as_str() {
            "gzip" if argv[1] == "-dc" => read(arg(2)).map(|t| Some(unpack(t))),
            "gzip" if argv[1] == "-fd" => read(arg(2)).and_then(|text| {
                let plain = arg(2).as_str().trim_end_matches(".gz").to_string();
                fs::write(plain, unpack(text))?;
                fs::remove_file(arg(2))?;
                Ok(None)
            }),
            "rgfa-split" => self.rgfa_split(argv).map(|()| None),
            "samtools" => read(arg(2)).and_then(|fasta| {
                let regions = read(arg(4))?;
                let mut out = String::new();
                for name in regions.lines() {
                    let header = format!(">{name}");
                    let mut lines = fasta.lines().skip_while(|l| *l != header);
                    if let (Some(h), Some(seq)) = (lines.next(), lines.next()) {
                        out.push_str(&format!("{h}\n{seq}\n"));
                    }
                }
                Ok(Some(out))
            }),
            "cactus-align" => {
                let log = argv
                    .iter()
                    .position(|a| a == "--logFile")
                    .map(|i| arg(i + 1));
                (|| -> std::io::Result<Option<String>> {
                    let hal = format!("hal\n{}{}", read(arg(2))?, read(arg(3))?);
                    fs::write(arg(4), hal)?;
                    if let Some(log) = log {
                        fs::write(log, "aligned\n")?;
                    }
                    Ok(None)
                })()
            }
            "true" => Ok(None),
            "hal2vg" => read(arg(1)).map(|hal| Some(format!("vg\n{hal}"))),
            "vg" => read(arg(3)).map(|vg| Some(format!("gz:gfa\n{vg}"))),
            _ => {
                return Err(ToolError::Spawn {
                    command,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
                });
            }
        };

        let redirect = |source| ToolError::Redirect {
            command: command.clone(),
            source,
        };
        match (output.map_err(redirect)?, &invocation.stdout) {
            (Some(text), Some(path)) => fs::write(path, text).map_err(redirect),
            _ => Ok(()),
        }
    }
}
