use std::fs;
use std::io;
use std::sync::{mpsc, Arc, PoisonError};
use std::thread;
use std::time::Duration;

mod toy;

use archsim_core::config::{EngineKind, ExecutionMode};
use archsim_core::execution::{
    share, BasicExecutionEngine, BlockJitStepper, EngineError, ExecutionContextManager,
    ExecutionEngine, InterpreterStepper, SharedThread, SyncExecutionEngine,
};
use archsim_core::memory::MemoryDevice;
use archsim_core::module::{
    Device, DeviceAdapter, ModuleDescriptor, ModuleError, ModuleManager, ParameterValue,
    ParameterValues,
};
use archsim_core::monitor::{BaseMemoryMonitor, MemoryMonitor};
use archsim_core::resources::ram;
use archsim_core::thread::{GuestThreadId, ThreadInstance};
use archsim_core::trace::LogTraceSink;
use archsim_core::{Address, Config};
use clap::{ArgAction, Parser, ValueEnum};
use log::{debug, info, warn};
use stderrlog::LogLevelNum;
use toy::ToyTranslator;

#[derive(ValueEnum, Copy, Clone, Debug)]
enum Engine {
    Interpreter,
    BlockJit,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
enum Mode {
    /// One host thread per guest thread.
    Async,
    /// Every guest thread on one host thread, round-robin.
    Sync,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Image to execute. Without one, every thread runs the built-in ll/sc counter program.
    binary: Option<String>,
    /// Treat the image as an ELF file instead of a flat binary loaded at address zero.
    #[arg(short, long)]
    elf: bool,
    /// Number of guest threads, all starting at the entry point.
    #[arg(short, long, default_value_t = 2)]
    threads: u32,
    #[arg(long, value_enum, default_value_t = Engine::Interpreter)]
    engine: Engine,
    #[arg(long, value_enum, default_value_t = Mode::Async)]
    mode: Mode,
    /// Blocks each thread may run before it is halted.
    #[arg(long)]
    step_limit: Option<u64>,
    /// Halt everything after this many milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Log every executed instruction, register and memory access.
    #[arg(long)]
    trace: bool,
    /// Increments per thread of the built-in counter program.
    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u16).range(1..=toy::MAX_ITERATIONS as i64)
    )]
    iterations: u16,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let verbosity = match (args.trace, args.verbose) {
        (true, _) => LogLevelNum::Trace,
        (false, 0) => LogLevelNum::Warn,
        (false, 1) => LogLevelNum::Info,
        (false, 2) => LogLevelNum::Debug,
        (false, _) => LogLevelNum::Trace,
    };
    stderrlog::new()
        .verbosity(verbosity)
        .modules([module_path!(), "archsim_core", "archsim_ir"])
        .init()
        .map_err(io::Error::other)?;

    let config = Config {
        execution_mode: match args.mode {
            Mode::Async => ExecutionMode::Async,
            Mode::Sync => ExecutionMode::Sync,
        },
        engine: match args.engine {
            Engine::Interpreter => EngineKind::Interpreter,
            Engine::BlockJit => EngineKind::BlockJit,
        },
        step_limit: args.step_limit,
        trace: args.trace,
        ..Config::default()
    };

    let modules = modules().map_err(io::Error::other)?;
    let ram = modules
        .instantiate_device(
            "demo",
            "ram",
            &ParameterValues::new().with("size", ParameterValue::U64(toy::RAM_SIZE)),
        )
        .map_err(io::Error::other)?;

    let entry = match &args.binary {
        Some(path) => {
            let buf = fs::read(path)?;
            if args.elf {
                load_elf(&*ram, &buf)?
            } else {
                ram.write(0, &buf).map_err(io::Error::other)?;
                Address::NULL
            }
        }
        None => {
            let image: Vec<u8> = toy::counter_program(args.iterations)
                .ok_or_else(|| io::Error::other("iteration count out of range"))?
                .iter()
                .flat_map(|word| word.to_le_bytes())
                .collect();
            ram.write(0, &image).map_err(io::Error::other)?;
            Address::NULL
        }
    };
    let memory: Arc<dyn MemoryDevice> = Arc::new(DeviceAdapter::new(ram));

    let threads = build_threads(&config, &args, Arc::clone(&memory), entry)?;

    let mut manager = ExecutionContextManager::new();
    if config.trace {
        manager.set_trace_sink(Some(Arc::new(LogTraceSink)));
    }
    let engine = engine(&config, "toy");
    for thread in &threads {
        engine
            .attach_thread(Arc::clone(thread))
            .map_err(io::Error::other)?;
    }
    manager.add_engine(engine);

    run(&manager, args.timeout_ms.map(Duration::from_millis)).map_err(io::Error::other)?;
    report(&manager, &threads, &*memory);

    Ok(())
}

fn modules() -> Result<ModuleManager, ModuleError> {
    let mut module = ModuleDescriptor::new("demo");
    module.add_device("ram", ram::schema(), ram::factory)?;
    let mut manager = ModuleManager::new();
    manager.register_module(module)?;
    Ok(manager)
}

/// Copies the allocated sections of an ELF image into `device` and returns its entry point.
fn load_elf(device: &dyn Device, program_elf: &[u8]) -> io::Result<Address> {
    let elf_header = goblin::elf::Elf::parse(program_elf).map_err(io::Error::other)?;

    let sections = elf_header
        .section_headers
        .iter()
        .filter(|h| h.is_alloc() && h.sh_type != goblin::elf::section_header::SHT_NOBITS);

    for h in sections {
        debug!(
            "loading section {:?} into memory from [{:#010x?}..{:#010x?}]",
            elf_header.shdr_strtab.get_at(h.sh_name).unwrap_or("?"),
            h.sh_addr,
            h.sh_addr + h.sh_size,
        );

        let buf = h
            .file_range()
            .and_then(|range| program_elf.get(range))
            .ok_or_else(|| io::Error::other("section lies outside the file"))?;
        device.write(h.sh_addr, buf).map_err(io::Error::other)?;
    }

    Ok(Address::new(elf_header.entry))
}

fn build_threads(
    config: &Config,
    args: &Args,
    memory: Arc<dyn MemoryDevice>,
    entry: Address,
) -> io::Result<Vec<SharedThread>> {
    let arch = toy::arch().map_err(io::Error::other)?;
    let monitor: Arc<dyn MemoryMonitor> = Arc::new(BaseMemoryMonitor::new());

    (0..args.threads)
        .map(|i| {
            let mut thread = ThreadInstance::builder(GuestThreadId::new(i), Arc::clone(&arch))
                .connect("Mem", Arc::clone(&memory))
                .monitor(Arc::clone(&monitor))
                .misaligned_access(config.support_misaligned_memory_access)
                .build()
                .map_err(io::Error::other)?;
            thread.set_pc(entry).map_err(io::Error::other)?;
            thread
                .set_sp(Address::new(toy::RAM_SIZE.saturating_sub(i as u64 * toy::STACK_SIZE)))
                .map_err(io::Error::other)?;
            Ok(share(thread))
        })
        .collect()
}

fn engine(config: &Config, name: &str) -> Arc<dyn ExecutionEngine> {
    let translator = Arc::new(ToyTranslator);
    match (config.execution_mode, config.engine) {
        (ExecutionMode::Async, EngineKind::Interpreter) => {
            Arc::new(BasicExecutionEngine::interpreter(name, config))
        }
        (ExecutionMode::Async, EngineKind::BlockJit) => {
            Arc::new(BasicExecutionEngine::block_jit(name, config, translator))
        }
        (ExecutionMode::Sync, EngineKind::Interpreter) => {
            Arc::new(SyncExecutionEngine::interpreter(name, config))
        }
        (ExecutionMode::Sync, EngineKind::BlockJit) => Arc::new(SyncExecutionEngine::new(
            name,
            config,
            BlockJitStepper::new(config, translator),
        )),
    }
}

fn run(manager: &ExecutionContextManager, timeout: Option<Duration>) -> Result<(), EngineError> {
    // Without a deadline a sync engine is driven from this thread.
    if timeout.is_none() {
        let result = if let Some(engine) = manager.engine::<SyncExecutionEngine<InterpreterStepper>>(0) {
            Some(engine.run()?)
        } else if let Some(engine) = manager.engine::<SyncExecutionEngine<BlockJitStepper>>(0) {
            Some(engine.run()?)
        } else {
            None
        };
        if let Some(result) = result {
            info!("sync run ended with {result:?}");
            return Ok(());
        }
    }

    manager.start()?;
    match timeout {
        None => manager.join(),
        Some(timeout) => thread::scope(|scope| {
            let (done, finished) = mpsc::channel();
            scope.spawn(move || {
                manager.join();
                let _ = done.send(());
            });
            if finished.recv_timeout(timeout).is_err() {
                warn!("no halt after {timeout:?}, halting");
                manager.halt();
            }
        }),
    }
    Ok(())
}

fn report(manager: &ExecutionContextManager, threads: &[SharedThread], memory: &dyn MemoryDevice) {
    println!("engine: {:?}", manager.state());
    for thread in threads {
        let id = thread.lock().unwrap_or_else(PoisonError::into_inner).id();
        let result = manager
            .engines()
            .iter()
            .find_map(|engine| engine.last_result(id));
        let thread = thread.lock().unwrap_or_else(PoisonError::into_inner);
        let registers: Vec<String> = (0..8)
            .map(|i| match thread.read_register::<u32>("R", i) {
                Ok(value) => format!("{value:#x}"),
                Err(_) => "?".to_owned(),
            })
            .collect();
        println!(
            "thread {id}: pc {} sp {} result {:?} [{}]",
            thread.pc().unwrap_or_default(),
            thread.sp().unwrap_or_default(),
            result,
            registers.join(" "),
        );
    }

    let mut buf = [0u8; 4];
    if memory.read(Address::new(toy::COUNTER), &mut buf).is_ok() {
        println!("counter: {}", u32::from_le_bytes(buf));
    }
}
