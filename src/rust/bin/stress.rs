// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgAction,
    ArgMatches,
    Command,
};
use ::jobmgr::{
    ipc::{
        IpcEndpoint,
        Message,
        NamedPort,
        SendResult,
    },
    locks::{
        LockEntry,
        LockOutcome,
    },
    runtime::logging,
    waitfor::{
        wait_for_multiple,
        WaitItem,
        WaitOutcome,
    },
    Config,
    GroupId,
    RunContext,
    RunResult,
    SchedulerConfig,
    SharedJobManager,
    SuspendReason,
    VMGroup,
    VirtualMachine,
    VmError,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Port served by the sink job.
const SINK_PORT: &str = "stress:sink";

/// Lock that bounds how many producers talk to the sink at once.
const POOL_LOCK: &str = "stress:pool";

/// Producers admitted by [POOL_LOCK] at a time.
const POOL_SIZE: usize = 4;

/// Producers yield every this many messages while they have yields left.
const YIELD_EVERY: u32 = 8;

const DEFAULT_JOBS: usize = 32;
const DEFAULT_MAX_MESSAGES: u32 = 200;
const DEFAULT_SEED: u64 = 42;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// YAML configuration file for the scheduler.
    config: Option<String>,
    /// Overrides the number of worker threads.
    workers: Option<usize>,
    /// Number of producer jobs.
    jobs: usize,
    /// Upper bound of messages sent by one producer.
    max_messages: u32,
    /// Seed for the job mix.
    seed: u64,
    /// How long to wait for all jobs.
    timeout: Duration,
    /// Print the final scheduler status.
    status: bool,
}

impl ProgramArguments {
    /// Parses the program arguments from the command line interface.
    pub fn new() -> Result<Self> {
        let matches: ArgMatches = Command::new("jobmgr-stress")
            .about("Runs a mix of producer jobs against a sink job over a named port")
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the YAML configuration file"),
            )
            .arg(
                Arg::new("workers")
                    .long("workers")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("N")
                    .help("Sets the number of worker threads"),
            )
            .arg(
                Arg::new("jobs")
                    .long("jobs")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("N")
                    .help("Sets the number of producer jobs"),
            )
            .arg(
                Arg::new("messages")
                    .long("messages")
                    .value_parser(clap::value_parser!(u32))
                    .required(false)
                    .value_name("N")
                    .help("Sets the maximum number of messages per producer"),
            )
            .arg(
                Arg::new("seed")
                    .long("seed")
                    .value_parser(clap::value_parser!(u64))
                    .required(false)
                    .value_name("SEED")
                    .help("Sets the seed of the job mix"),
            )
            .arg(
                Arg::new("timeout")
                    .long("timeout")
                    .value_parser(clap::value_parser!(u64))
                    .required(false)
                    .value_name("SECONDS")
                    .help("Sets how long to wait for all jobs"),
            )
            .arg(
                Arg::new("status")
                    .long("status")
                    .action(ArgAction::SetTrue)
                    .help("Prints the final scheduler status as JSON"),
            )
            .get_matches();

        let max_messages: u32 = matches.get_one::<u32>("messages").copied().unwrap_or(DEFAULT_MAX_MESSAGES);
        if max_messages == 0 {
            anyhow::bail!("--messages must be at least 1");
        }

        Ok(Self {
            config: matches.get_one::<String>("config").cloned(),
            workers: matches.get_one::<usize>("workers").copied(),
            jobs: matches.get_one::<usize>("jobs").copied().unwrap_or(DEFAULT_JOBS),
            max_messages,
            seed: matches.get_one::<u64>("seed").copied().unwrap_or(DEFAULT_SEED),
            timeout: Duration::from_secs(matches.get_one::<u64>("timeout").copied().unwrap_or(DEFAULT_TIMEOUT_SECS)),
            status: matches.get_flag("status"),
        })
    }

    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let config: SchedulerConfig = match &self.config {
            Some(path) => SchedulerConfig::from_config(&Config::new(path)?)?,
            None => SchedulerConfig::default(),
        };
        Ok(match self.workers {
            Some(workers) => config.with_workers(workers),
            None => config,
        })
    }
}

//======================================================================================================================
// Jobs
//======================================================================================================================

/// What one producer does.
#[derive(Clone, Copy, Debug)]
struct ProducerPlan {
    messages: u32,
    yields: u32,
    high_priority: bool,
}

/// Takes a slot of the pool lock, connects to the sink and sends its messages.
struct ProducerVm {
    index: usize,
    plan: ProducerPlan,
    sent: u32,
    entry: Option<Arc<LockEntry>>,
    endpoint: Option<Arc<IpcEndpoint>>,
}

/// Accepts producers on the sink port and counts what they send.
struct SinkVm {
    port: Arc<NamedPort>,
    connections: Vec<Arc<IpcEndpoint>>,
    expected: u64,
    received: Arc<AtomicU64>,
}

impl ProducerVm {
    fn new(index: usize, plan: ProducerPlan) -> Self {
        Self {
            index,
            plan,
            sent: 0,
            entry: None,
            endpoint: None,
        }
    }

    fn lock_entry(&mut self, ctx: &RunContext) -> Result<Arc<LockEntry>, VmError> {
        if let Some(entry) = &self.entry {
            return Ok(entry.clone());
        }
        let group: GroupId = ctx.group().id();
        let entry: LockEntry = match ctx.manager().locks().add_queue_entry(group, POOL_LOCK, POOL_SIZE, false) {
            Ok(LockOutcome::Granted(entry)) | Ok(LockOutcome::Queued(entry)) => entry,
            Ok(LockOutcome::Unavailable) => return Err(VmError::from("pool lock unavailable")),
            Err(e) => return Err(VmError::from(e.cause.as_str())),
        };
        let entry: Arc<LockEntry> = Arc::new(entry);
        self.entry = Some(entry.clone());
        Ok(entry)
    }

    fn sink(&mut self, ctx: &RunContext) -> Result<Arc<IpcEndpoint>, VmError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        let endpoint: Arc<IpcEndpoint> = match ctx.manager().connect_to_named_port(SINK_PORT) {
            Ok(endpoint) => Arc::new(endpoint),
            Err(e) => return Err(VmError::from(e.cause.as_str())),
        };
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }
}

impl VirtualMachine for ProducerVm {
    fn run(&mut self, ctx: &mut RunContext) -> Result<RunResult, VmError> {
        let _ = ctx.take_wait_result();
        loop {
            if ctx.abort_reason().is_terminating() {
                return Ok(RunResult::Terminated);
            }

            let entry: Arc<LockEntry> = self.lock_entry(ctx)?;
            if !entry.is_granted() {
                if let Some(result) = park(ctx, WaitItem::read(1, entry))? {
                    return Ok(result);
                }
                continue;
            }

            let endpoint: Arc<IpcEndpoint> = self.sink(ctx)?;
            while self.sent < self.plan.messages {
                let payload: Vec<u8> = [self.index.to_le_bytes().as_slice(), &self.sent.to_le_bytes()].concat();
                match endpoint.send_message(Message::new(payload), true) {
                    SendResult::Sent(_) => self.sent += 1,
                    SendResult::LinkFull => {
                        if let Some(result) = park(ctx, WaitItem::write(2, endpoint.clone()))? {
                            return Ok(result);
                        }
                        continue;
                    },
                    SendResult::Gone => return Err(VmError::from("sink went away")),
                }
                if self.plan.yields > 0 && self.sent % YIELD_EVERY == 0 {
                    self.plan.yields -= 1;
                    return Ok(RunResult::Suspended(SuspendReason::Yield));
                }
            }

            trace!("producer {}: sent {} messages", self.index, self.sent);
            self.endpoint = None;
            self.entry = None;
            return Ok(RunResult::Completed);
        }
    }
}

impl VirtualMachine for SinkVm {
    fn run(&mut self, ctx: &mut RunContext) -> Result<RunResult, VmError> {
        let _ = ctx.take_wait_result();
        loop {
            if ctx.abort_reason().is_terminating() {
                return Ok(RunResult::Terminated);
            }

            while let Some(endpoint) = self.port.accept() {
                self.connections.push(Arc::new(endpoint));
            }
            for connection in &self.connections {
                while connection.receive_message().is_some() {
                    self.received.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.connections
                .retain(|connection| !(connection.is_broken() && connection.queued() == 0));
            if self.received.load(Ordering::Relaxed) >= self.expected {
                return Ok(RunResult::Completed);
            }

            let mut items: Vec<WaitItem> = vec![WaitItem::read(0, self.port.clone())];
            for (i, connection) in self.connections.iter().enumerate() {
                items.push(WaitItem::read(i as i32 + 1, connection.clone()));
            }
            match wait_for_multiple(ctx, items, None) {
                Ok(WaitOutcome::Suspended) => return Ok(RunResult::Suspended(SuspendReason::WaitForMultiple)),
                Ok(WaitOutcome::Ready(_)) => (),
                Err(e) => return Err(VmError::from(e.cause.as_str())),
            }
        }
    }
}

//======================================================================================================================
// Application
//======================================================================================================================

struct Application {
    manager: SharedJobManager,
    plans: Vec<ProducerPlan>,
    timeout: Duration,
    status: bool,
}

impl Application {
    fn new(args: &ProgramArguments) -> Result<Self> {
        let manager: SharedJobManager = SharedJobManager::new(args.scheduler_config()?)?;
        let mut rng: SmallRng = SmallRng::seed_from_u64(args.seed);
        let plans: Vec<ProducerPlan> = (0..args.jobs)
            .map(|_| ProducerPlan {
                messages: rng.gen_range(1..=args.max_messages),
                yields: rng.gen_range(0..4),
                high_priority: rng.gen_bool(0.25),
            })
            .collect();
        Ok(Self {
            manager,
            plans,
            timeout: args.timeout,
            status: args.status,
        })
    }

    fn run(&self) -> Result<()> {
        let expected: u64 = self.plans.iter().map(|plan| plan.messages as u64).sum();
        let received: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
        let start: Instant = Instant::now();

        let sink: VMGroup = self.manager.create_vm_group(true)?;
        let vm: SinkVm = SinkVm {
            port: self.manager.create_named_port(SINK_PORT)?,
            connections: Vec::new(),
            expected,
            received: received.clone(),
        };
        self.manager.attach_vm(&sink, "stress/sink.whscr", Box::new(vm))?;
        self.manager.start_vm_group(&sink)?;

        let mut producers: Vec<VMGroup> = Vec::with_capacity(self.plans.len());
        for (index, plan) in self.plans.iter().enumerate() {
            let group: VMGroup = self.manager.create_vm_group(plan.high_priority)?;
            let script: String = format!("stress/producer{}.whscr", index);
            self.manager.attach_vm(&group, &script, Box::new(ProducerVm::new(index, *plan)))?;
            self.manager.start_vm_group(&group)?;
            producers.push(group);
        }
        info!("started {} producers sending {} messages", producers.len(), expected);

        let deadline: Instant = start + self.timeout;
        for group in producers.iter().chain(::std::iter::once(&sink)) {
            let left: Duration = deadline.saturating_duration_since(Instant::now());
            if !group.wait_finished(Some(left))? {
                anyhow::bail!("job {} did not finish within {:?}", group.id(), self.timeout);
            }
        }

        let elapsed: Duration = start.elapsed();
        println!(
            "{} jobs, {} messages in {:?} ({} central waits)",
            producers.len() + 1,
            received.load(Ordering::Relaxed),
            elapsed,
            self.manager.central_wait_count()
        );
        if self.status {
            println!("{}", ::serde_json::to_string_pretty(&self.manager.get_status())?);
        }
        Ok(())
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Waits on one handle. Returns the result the slice must end with if the group got parked.
fn park(ctx: &mut RunContext, item: WaitItem) -> Result<Option<RunResult>, VmError> {
    match wait_for_multiple(ctx, vec![item], None) {
        Ok(WaitOutcome::Suspended) => Ok(Some(RunResult::Suspended(SuspendReason::WaitForMultiple))),
        Ok(WaitOutcome::Ready(_)) => Ok(None),
        Err(e) => Err(VmError::from(e.cause.as_str())),
    }
}

fn main() -> Result<()> {
    logging::initialize();
    let args: ProgramArguments = ProgramArguments::new()?;
    Application::new(&args)?.run()
}
