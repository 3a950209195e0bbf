//! Run command - execute a program with optional monitoring

use super::load_program;
use anyhow::{ensure, Context, Result};
use quicken_config::QuickenConfig;
use quicken_runtime::{
    EventDetail, Events, HookAction, MonitorEvent, Monitoring, ToolId, Value, Vm, VmConfig,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tool slot the CLI tracer attaches to.
const TRACE_TOOL: ToolId = ToolId::DEBUGGER;

pub struct RunArgs {
    pub file: PathBuf,
    pub monitor: Option<String>,
    pub no_specialize: bool,
    pub warmup: Option<u16>,
    pub stats: bool,
    pub json: bool,
    pub profile: bool,
    pub trace_events: bool,
}

/// Run a program and print its result to stdout.
pub fn run(args: &RunArgs, config: &QuickenConfig) -> Result<()> {
    let code = load_program(&args.file)?;
    let vm_config = vm_config(args, config)?;
    let events = monitored_events(args, config)?;

    let monitoring = Arc::new(Monitoring::new());
    let counters = if events.is_empty() {
        Vec::new()
    } else {
        attach_tracer(&monitoring, events, args.trace_events)?
    };

    let mut vm = Vm::with_config(vm_config).with_monitoring(Arc::clone(&monitoring));
    let result = vm
        .run(code)
        .with_context(|| format!("Error while running {}", args.file.display()));

    if !counters.is_empty() {
        eprintln!("events:");
        for (name, count) in &counters {
            eprintln!("  {:<16}{}", name, count.load(Ordering::Relaxed));
        }
    }
    if args.stats {
        if args.json {
            eprintln!("{}", vm.stats().to_json()?);
        } else {
            eprint!("{}", vm.stats().report());
        }
    }

    let value = result?;
    if !matches!(value, Value::None) {
        println!("{}", value.repr());
    }
    Ok(())
}

/// Configuration file settings with command-line flags on top.
fn vm_config(args: &RunArgs, config: &QuickenConfig) -> Result<VmConfig> {
    let mut vm_config = VmConfig::from_config(config);
    if args.no_specialize {
        vm_config.specialization.enabled = false;
    }
    if let Some(warmup) = args.warmup {
        ensure!(warmup > 0, "--warmup must be at least 1");
        vm_config.specialization.warmup = warmup;
    }
    if args.profile {
        vm_config.profile = true;
    }
    Ok(vm_config)
}

/// `--monitor` wins over `[monitoring] events`.
fn monitored_events(args: &RunArgs, config: &QuickenConfig) -> Result<Events> {
    match &args.monitor {
        Some(list) => Ok(Events::parse_list(list)?),
        None => config
            .monitoring
            .events
            .iter()
            .try_fold(Events::empty(), |acc, name| {
                Events::parse_one(name).map(|event| acc | event)
            })
            .map_err(Into::into),
    }
}

type Counters = Vec<(&'static str, Arc<AtomicU64>)>;

/// Subscribe a counting (and optionally printing) observer to each event.
fn attach_tracer(monitoring: &Monitoring, events: Events, print: bool) -> Result<Counters> {
    monitoring.use_tool(TRACE_TOOL, "quicken-trace")?;
    let mut counters = Vec::new();
    for event in events.each() {
        let name = event.name().unwrap_or("?");
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        monitoring.register(TRACE_TOOL, event, move |fired: &MonitorEvent| {
            seen.fetch_add(1, Ordering::Relaxed);
            if print {
                eprintln!("{}", format_event(name, fired));
            }
            HookAction::Continue
        })?;
        counters.push((name, count));
    }
    monitoring.set_events(TRACE_TOOL, events)?;
    Ok(counters)
}

/// One trace line: `event code@offset OPCODE detail`.
fn format_event(name: &str, event: &MonitorEvent) -> String {
    let detail = match &event.detail {
        EventDetail::None => String::new(),
        EventDetail::Line(line) => format!(" line {}", line),
        EventDetail::Jump { target } => format!(" -> {}", target),
        EventDetail::Branch { target, taken } => format!(
            " -> {} ({})",
            target,
            if *taken { "taken" } else { "not taken" }
        ),
        EventDetail::Call {
            callable,
            arg_count,
        } => format!(" {} with {} args", callable.repr(), arg_count),
        EventDetail::Return(value) | EventDetail::Yield(value) => format!(" = {}", value.repr()),
    };
    format!(
        "[{}] {}@{} {}{}",
        name, event.code, event.offset, event.opcode, detail
    )
}
