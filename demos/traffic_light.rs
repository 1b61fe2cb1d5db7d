//! Traffic Light
//!
//! A junction of traffic lights, each one a timer-driven machine hosted by
//! the scheduler.
//!
//! Key concepts:
//! - Per-state timeouts with `set_next_timeout`
//! - Guards that refuse unsafe transitions
//! - Two-way commands answered from inside the machine's lock
//! - Terminating a machine from its own command handler
//!
//! Run with: cargo run --example traffic_light

use async_trait::async_trait;
use bigmachine::sink::BoxError;
use bigmachine::{
    state_enum, BigMachine, ChangeOutcome, Flow, MachineCx, MachineLogic, MachineRegistry,
    MachineSpec, SchedulerConfig, State,
};
use std::time::Duration;

state_enum! {
    enum Signal {
        Red,
        Green,
        Yellow,
        Flashing,
    }
    initial: Red
}

#[derive(Debug, Clone)]
enum Control {
    Report,
    Flash,
    Decommission,
}

struct Light {
    cycles: u32,
}

impl Light {
    fn hold_for(signal: Signal) -> Duration {
        match signal {
            Signal::Red => Duration::from_millis(300),
            Signal::Green => Duration::from_millis(250),
            Signal::Yellow => Duration::from_millis(100),
            Signal::Flashing => Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl MachineLogic for Light {
    type Id = &'static str;
    type State = Signal;
    type Command = Control;
    type Reply = String;

    fn initial_state(&self) -> Signal {
        Signal::default()
    }

    async fn run_state(cx: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError> {
        let next = match *cx.state() {
            Signal::Red => Signal::Green,
            Signal::Green => Signal::Yellow,
            Signal::Yellow => {
                cx.cycles += 1;
                Signal::Red
            }
            Signal::Flashing => Signal::Flashing,
        };
        if cx.change_state(next, false) == ChangeOutcome::Success {
            println!("  {:<6} -> {}", cx.id(), next.name());
        }
        cx.set_next_timeout(Self::hold_for(next));
        Ok(Flow::Continue)
    }

    async fn on_command(cx: &mut MachineCx<'_, Self>, control: Control) -> Result<String, BoxError> {
        match control {
            Control::Report => Ok(format!(
                "{} is {} after {} cycles",
                cx.id(),
                cx.state().name(),
                cx.cycles
            )),
            Control::Flash => {
                let outcome = cx.change_state(Signal::Flashing, false);
                Ok(format!("{} flashing: {:?}", cx.id(), outcome))
            }
            Control::Decommission => {
                cx.terminate();
                Ok(format!("{} decommissioned", cx.id()))
            }
        }
    }

    // A flashing light stays flashing until it is decommissioned.
    fn can_exit(&self, state: &Signal) -> bool {
        *state != Signal::Flashing
    }

    async fn on_terminate(&mut self) {
        println!("  light switched off after {} cycles", self.cycles);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Traffic Light Junction ===\n");

    let spec = MachineSpec::<Light>::builder()
        .tag("light")
        .default_timeout(Light::hold_for(Signal::Red))
        .factory(|_| Light { cycles: 0 })
        .build()?;
    let config = SchedulerConfig::builder()
        .tick_interval(Duration::from_millis(20))
        .build()?;
    let scheduler = BigMachine::new(MachineRegistry::new().with(spec)?, config);

    let control = scheduler.control::<Light>()?;
    for id in ["north", "east"] {
        control.get_or_create(id)?;
    }
    let post = scheduler.post::<Light>()?;
    let wait = Duration::from_secs(1);

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    println!("\nReports:");
    for id in ["north", "east"] {
        println!("  {}", post.send_two_way(&id, &Control::Report, wait).await?);
    }

    println!("\nMaintenance on east:");
    println!("  {}", post.send_two_way(&"east", &Control::Flash, wait).await?);
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("  {}", post.send_two_way(&"east", &Control::Report, wait).await?);
    println!("  {}", post.send_two_way(&"east", &Control::Decommission, wait).await?);

    scheduler.wait_idle().await;
    println!("\nLights still running: {}", scheduler.machine_count());

    scheduler.shutdown().await;
    println!("\n=== Junction closed ===");
    Ok(())
}
