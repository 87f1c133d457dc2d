//! Runs one sample exchange through a bus and prints what happened.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use phasewire_core::{
    names, ChainOutcome, FnInterceptor, InterceptorMeta, InterceptorProvider, Message,
    SharedInterceptor, SuspendedInvocation,
};
use phasewire_server::{
    init_tracing, Binding, Bus, BusConfig, ChainInitiationObserver, ContinuationRegistry,
    Endpoint, LoggingInInterceptor, LoggingOutInterceptor, Service,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "phasewire-demo", about = "Dispatch a sample exchange through a phase chain")]
struct Args {
    /// JSON bus configuration; defaults are used for missing fields.
    #[arg(long, env = "PHASEWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `bus_id`.
    #[arg(long, env = "PHASEWIRE_BUS_ID")]
    bus_id: Option<String>,

    /// Skip interceptors with unknown phases instead of failing.
    #[arg(long)]
    lenient: bool,

    /// Overrides the log filter directive.
    #[arg(long, env = "PHASEWIRE_LOG")]
    log_filter: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Id of the sample interceptor that should fail (decode, authorize,
    /// invoke, encode).
    #[arg(long)]
    fail_at: Option<String>,

    /// Suspend in the invoke phase and resume through the continuation
    /// registry.
    #[arg(long)]
    suspend: bool,
}

type Trace = Arc<Mutex<Vec<String>>>;

fn stage(trace: &Trace, id: &str, phase: &str, fail: bool) -> SharedInterceptor {
    let on_message = Arc::clone(trace);
    let on_fault = Arc::clone(trace);
    let name = id.to_string();
    let fault_name = id.to_string();
    FnInterceptor::new(InterceptorMeta::new(id, phase), move |_| {
        on_message.lock().push(name.clone());
        if fail {
            anyhow::bail!("{name} failed on request");
        }
        Ok(())
    })
    .with_fault(move |_| on_fault.lock().push(format!("{fault_name} (unwound)")))
    .shared()
}

fn suspending(trace: &Trace) -> SharedInterceptor {
    let trace = Arc::clone(trace);
    let waited = Arc::new(Mutex::new(false));
    FnInterceptor::new(
        InterceptorMeta::new("await-backend", names::INVOKE).with_before("invoke"),
        move |_| {
            let mut waited = waited.lock();
            if *waited {
                trace.lock().push(String::from("await-backend (resumed)"));
                return Ok(());
            }
            *waited = true;
            trace.lock().push(String::from("await-backend (suspended)"));
            Err(SuspendedInvocation.into())
        },
    )
    .shared()
}

fn load_config(args: &Args) -> anyhow::Result<BusConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            BusConfig::from_json_str(&json)?
        }
        None => BusConfig::default(),
    };
    if let Some(bus_id) = &args.bus_id {
        config.bus_id.clone_from(bus_id);
    }
    if args.lenient {
        config.strict_phases = false;
    }
    if let Some(filter) = &args.log_filter {
        config.logging.filter.clone_from(filter);
    }
    if args.json_logs {
        config.logging.json = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    let bus = Bus::new(config)?;
    let registry = ContinuationRegistry::for_bus(&bus);
    let trace = Trace::default();
    let fails = |id: &str| args.fail_at.as_deref() == Some(id);

    let service = Arc::new(Service::new("greeter"));
    let binding = Arc::new(Binding::new("json"));
    let endpoint = Arc::new(Endpoint::new("greeter-json", Arc::clone(&service), binding));

    bus.in_interceptors().push(Arc::new(LoggingInInterceptor::new()));
    bus.out_fault_interceptors().push(Arc::new(LoggingOutInterceptor::new()));
    endpoint.binding().in_interceptors().push(stage(&trace, "decode", names::UNMARSHAL, fails("decode")));
    endpoint.in_interceptors().push(stage(&trace, "authorize", names::PRE_INVOKE, fails("authorize")));
    service.in_interceptors().push(stage(&trace, "invoke", names::INVOKE, fails("invoke")));
    service.in_interceptors().push(stage(&trace, "encode", names::POST_INVOKE, fails("encode")));
    service.out_fault_interceptors().push(stage(&trace, "write-fault", names::MARSHAL, false));
    if args.suspend {
        endpoint.in_interceptors().push(suspending(&trace));
    }

    let observer = ChainInitiationObserver::new(Arc::clone(&bus), endpoint);
    let message = Message::new();
    message.set_content(String::from("hello"));
    let dispatched = observer.dispatch(&message)?;

    let outcome = match dispatched.outcome {
        ChainOutcome::Paused(continuation) | ChainOutcome::Suspended(continuation) => {
            let id = registry.park_with_timeout(continuation);
            info!(%id, "exchange parked; resuming from the registry");
            registry.resume(id).await?
        }
        other => other,
    };

    println!("bus:      {}", bus.id());
    println!("outcome:  {outcome:?}");
    println!("executed: {}", trace.lock().join(" -> "));
    if let Some(fault) = dispatched
        .exchange
        .out_fault_message()
        .and_then(|message| message.fault())
    {
        println!("fault:    {} (status {})", fault.message(), fault.status_code());
    }
    Ok(())
}
