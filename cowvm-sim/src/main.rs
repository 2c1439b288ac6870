use clap::{Parser, Subcommand};
use cowvm::config::{
    DEFAULT_TABLE_FRAMES, DEFAULT_USER_FRAMES, MMAP_AREA_START, PAGE_SIZE, STACK_END,
};
use cowvm::syscall::{
    handle_page_fault, sys_cfork, sys_mmap, sys_mprotect, sys_munmap, MAP_FIXED, PROT_READ,
    PROT_WRITE,
};
use cowvm::{FrameStats, FrameTable, MemorySet, SegmentKind, VirtAddr, VmError};
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::process::ExitCode;
use std::sync::Arc;

mod logging;

const RW: i32 = PROT_READ | PROT_WRITE;
const WRITE_FAULT: u32 = 0x6;
const WRITE_PRESENT_FAULT: u32 = 0x7;
const SEGMENTS: [SegmentKind; 4] = [
    SegmentKind::Code,
    SegmentKind::Data,
    SegmentKind::Heap,
    SegmentKind::Stack,
];

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Frames in the user pool
    #[arg(short, long, default_value_t = DEFAULT_USER_FRAMES)]
    frames: usize,

    /// Frames in the page-table pool
    #[arg(short, long, default_value_t = DEFAULT_TABLE_FRAMES)]
    table_frames: usize,

    /// Seed of the stress run
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Operations performed by the stress run
    #[arg(long, default_value_t = 10_000)]
    steps: usize,

    /// Log level, overrides the LOG environment variable
    #[arg(short, long)]
    log: Option<String>,

    #[command(subcommand)]
    scenario: Option<Scenario>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq, Debug)]
enum Scenario {
    /// Map three pages, fault them in, unmap the middle one
    Mmap,
    /// Fork with a populated region, then write in the child
    Fork,
    /// Protect a sub-range read-only, then back
    Mprotect,
    /// Random map, unmap, protect, touch and fork operations
    Stress,
    /// Every scenario in turn
    All,
}

#[derive(Debug)]
enum SimError {
    Vm(VmError),
    Syscall(&'static str, isize),
    Check(&'static str),
}

impl From<VmError> for SimError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl Display for SimError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Vm(err) => write!(f, "{err}"),
            SimError::Syscall(name, ret) => write!(f, "{name} returned {ret}"),
            SimError::Check(what) => write!(f, "check failed: {what}"),
        }
    }
}

type SimResult<T> = Result<T, SimError>;

fn syscall(name: &'static str, ret: isize) -> SimResult<usize> {
    usize::try_from(ret).map_err(|_| SimError::Syscall(name, ret))
}

fn ensure(cond: bool, what: &'static str) -> SimResult<()> {
    if cond {
        Ok(())
    } else {
        Err(SimError::Check(what))
    }
}

fn print_regions(name: &str, ms: &MemorySet) {
    println!("{name}:");
    for area in ms.areas().iter() {
        println!("  {area:?}");
    }
    let stats = ms.stats();
    println!(
        "  {} regions, {} resident pages, {} table frames, {} tlb flushes",
        stats.regions, stats.resident_pages, stats.table_frames, stats.tlb_flushes
    );
}

fn print_frames(frames: &FrameTable) {
    let FrameStats {
        table_frames,
        user_frames,
    } = frames.stats();
    println!("frames in use: {table_frames} page-table, {user_frames} user");
}

fn run_mmap(frames: &Arc<FrameTable>) -> SimResult<()> {
    println!("== mmap ==");
    let mut ms = MemorySet::new_user(frames)?;
    let hint = MMAP_AREA_START + 0x10_0000;
    let base = syscall("mmap", sys_mmap(&mut ms, hint, 3 * PAGE_SIZE as i32, RW, 0))?;
    ensure(base % PAGE_SIZE == 0, "base is page aligned")?;

    for page in 0..3 {
        let ret = handle_page_fault(&mut ms, base + page * PAGE_SIZE, WRITE_FAULT);
        ensure(ret == 1, "write fault installs a mapping")?;
    }
    print_regions("after faulting three pages", &ms);

    syscall("munmap", sys_munmap(&mut ms, base + PAGE_SIZE, PAGE_SIZE as i32))?;
    print_regions("after unmapping the middle page", &ms);
    ensure(ms.areas().len() == 3, "gap splits the region")?;
    print_frames(frames);
    Ok(())
}

fn run_fork(frames: &Arc<FrameTable>) -> SimResult<()> {
    println!("== fork ==");
    let mut spaces = vec![MemorySet::new_user(frames)?];
    let base = syscall("mmap", sys_mmap(&mut spaces[0], 0, PAGE_SIZE as i32, RW, 0))?;
    let va = VirtAddr(base);
    spaces[0].copy_to_user(va, b"parent data")?;
    spaces[0].copy_to_user(VirtAddr(STACK_END - PAGE_SIZE), b"stack")?;

    let child = syscall("cfork", sys_cfork(&mut spaces, 0))?;
    let frame = spaces[0].leaf(va).ok_or(VmError::NotPresent)?.ppn();
    println!("shared {frame:?}, refcount {}", frames.refcount(frame));
    ensure(frames.refcount(frame) == 2, "fork takes a reference")?;

    let ret = handle_page_fault(&mut spaces[child], base, WRITE_PRESENT_FAULT);
    ensure(ret == 0, "child write is copy-on-write")?;
    spaces[child].copy_to_user(va, b"child data!")?;

    let mut buf = [0u8; 11];
    spaces[0].copy_from_user(va, &mut buf)?;
    println!("parent reads {:?}", String::from_utf8_lossy(&buf));
    ensure(&buf == b"parent data", "parent keeps its contents")?;
    spaces[child].copy_from_user(va, &mut buf)?;
    println!("child reads {:?}", String::from_utf8_lossy(&buf));

    print_regions("parent", &spaces[0]);
    print_regions("child", &spaces[child]);
    print_frames(frames);
    Ok(())
}

fn run_mprotect(frames: &Arc<FrameTable>) -> SimResult<()> {
    println!("== mprotect ==");
    let mut ms = MemorySet::new_user(frames)?;
    let base = syscall("mmap", sys_mmap(&mut ms, 0, 4 * PAGE_SIZE as i32, RW, 0))?;
    ms.copy_to_user(VirtAddr(base), &[0x5a; 4 * PAGE_SIZE])?;

    let mid = base + PAGE_SIZE;
    syscall("mprotect", sys_mprotect(&mut ms, mid, 2 * PAGE_SIZE as i32, PROT_READ))?;
    print_regions("after protecting the middle read-only", &ms);
    ensure(ms.areas().len() == 4, "protect carves out a region")?;

    syscall("mprotect", sys_mprotect(&mut ms, mid, 2 * PAGE_SIZE as i32, RW))?;
    print_regions("after protecting it back", &ms);
    ensure(ms.areas().len() == 2, "regions re-merge")?;
    Ok(())
}

fn check_refcounts(frames: &FrameTable, spaces: &[MemorySet]) -> SimResult<()> {
    let mut refs: BTreeMap<_, u32> = BTreeMap::new();
    for ms in spaces {
        ensure(ms.areas().check_invariants().is_ok(), "region map invariants")?;
        let segment_pages = SEGMENTS
            .iter()
            .flat_map(|&kind| ms.segment(kind).populated_range())
            .map(VirtAddr::from);
        let region_pages = ms
            .areas()
            .iter()
            .filter(|area| !area.is_reserved())
            .flat_map(|area| (area.start().0..area.end().0).step_by(PAGE_SIZE))
            .map(VirtAddr);
        for va in segment_pages.chain(region_pages) {
            if let Some(pte) = ms.leaf(va) {
                *refs.entry(pte.ppn()).or_default() += 1;
            }
        }
    }
    for (ppn, count) in refs {
        ensure(frames.refcount(ppn) == count, "refcount equals mappings")?;
    }
    Ok(())
}

fn run_stress(frames: &Arc<FrameTable>, seed: u64, steps: usize) -> SimResult<()> {
    println!("== stress (seed {seed}, {steps} steps) ==");
    let mut rng = StdRng::seed_from_u64(seed);
    let mut spaces = vec![MemorySet::new_user(frames)?];
    let mut failures = 0usize;
    let window = 256;

    for step in 0..steps {
        let idx = rng.gen_range(0..spaces.len());
        let addr = MMAP_AREA_START + rng.gen_range(1..window) * PAGE_SIZE;
        let len = (rng.gen_range(1..16) * PAGE_SIZE) as i32;
        let prot = if rng.gen_bool(0.5) { PROT_READ } else { RW };
        let ret = match rng.gen_range(0..10) {
            0 | 1 => {
                let flags = if rng.gen_bool(0.3) { MAP_FIXED } else { 0 };
                sys_mmap(&mut spaces[idx], addr, len, prot, flags)
            }
            2 => sys_munmap(&mut spaces[idx], addr, len),
            3 => sys_mprotect(&mut spaces[idx], addr, len, prot),
            4..=6 => match spaces[idx].copy_to_user(VirtAddr(addr), &[rng.gen::<u8>(); 64]) {
                Ok(()) => 0,
                Err(_) => -1,
            },
            7 => {
                let mut buf = [0u8; 64];
                match spaces[idx].copy_from_user(VirtAddr(addr), &mut buf) {
                    Ok(()) => 0,
                    Err(_) => -1,
                }
            }
            8 if spaces.len() < 8 => sys_cfork(&mut spaces, idx),
            _ if spaces.len() > 1 => {
                spaces.swap_remove(idx);
                0
            }
            _ => 0,
        };
        if ret < 0 {
            failures += 1;
        }
        check_refcounts(frames, &spaces)?;
        if step % 1000 == 0 {
            info!("step {step}: {} address spaces, {:?}", spaces.len(), frames.stats());
        }
    }

    println!("{} address spaces alive, {failures} operations refused", spaces.len());
    print_frames(frames);
    drop(spaces);
    ensure(frames.stats() == FrameStats::default(), "no frame leaks")?;
    println!("all frames returned");
    Ok(())
}

fn run(cli: &Cli) -> SimResult<()> {
    let frames = FrameTable::new(cli.table_frames, cli.frames);
    match cli.scenario.unwrap_or(Scenario::All) {
        Scenario::Mmap => run_mmap(&frames),
        Scenario::Fork => run_fork(&frames),
        Scenario::Mprotect => run_mprotect(&frames),
        Scenario::Stress => run_stress(&frames, cli.seed, cli.steps),
        Scenario::All => {
            run_mmap(&frames)?;
            run_fork(&frames)?;
            run_mprotect(&frames)?;
            run_stress(&frames, cli.seed, cli.steps)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cowvm-sim: {err}");
            ExitCode::FAILURE
        }
    }
}
