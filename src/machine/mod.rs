//! Machines: the engine, its execution context and its external handle.
//!
//! A machine type implements [`MachineLogic`]; the generic [`Machine`] engine
//! drives it. Every activity on a machine (a timer run, a command delivery or
//! a relayed state change) holds the machine's lock, so user code never runs
//! concurrently with itself.

mod context;
pub(crate) mod engine;
mod interface;
mod logic;
pub(crate) mod mailbox;
mod outcome;

pub use context::MachineCx;
pub use engine::Machine;
pub use interface::Interface;
pub use logic::{Disposer, Identifier, MachineLogic};
pub use outcome::{ChangeOutcome, Decision, Flow, RunOutcome, Trigger};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MachineSpec;
    use crate::chain::LoopPolicy;
    use crate::clock::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::control::Control;
    use crate::error::PostError;
    use crate::runtime::Runtime;
    use crate::sink::{BoxError, ExceptionSink, FaultPolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    crate::state_enum! {
        enum TestState {
            Idle,
            Working,
            Locked,
            Done,
        }
        initial: Idle
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Cmd {
        Echo(u32),
        Move(TestState),
        Fail,
        Stop,
        Quit,
        Peek,
    }

    #[derive(Default)]
    struct Recorder {
        runs: Vec<TestState>,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_runs: bool,
    }

    #[async_trait]
    impl MachineLogic for Recorder {
        type Id = u32;
        type State = TestState;
        type Command = Cmd;
        type Reply = u32;

        fn initial_state(&self) -> TestState {
            TestState::default()
        }

        async fn run_state(cx: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError> {
            let state = *cx.state();
            cx.runs.push(state);
            if cx.fail_runs {
                return Err("run failed".into());
            }
            match state {
                TestState::Idle => {
                    cx.change_state(TestState::Working, true);
                    Ok(Flow::Continue)
                }
                TestState::Done => Ok(Flow::Terminate),
                _ => Ok(Flow::Continue),
            }
        }

        async fn on_command(cx: &mut MachineCx<'_, Self>, command: Cmd) -> Result<u32, BoxError> {
            match command {
                Cmd::Echo(n) => Ok(n + 1),
                Cmd::Move(state) => Ok(cx.change_state(state, false) as u32),
                Cmd::Fail => panic!("command exploded"),
                Cmd::Stop => Ok(cx.terminate() as u32),
                Cmd::Quit => Ok(cx.interface().terminate().await as u32),
                Cmd::Peek => match cx.interface().state().await {
                    Err(PostError::CycleBroken { .. }) => Ok(1),
                    _ => Ok(0),
                },
            }
        }

        fn can_enter(&self, state: &TestState) -> bool {
            *state != TestState::Locked
        }

        fn can_exit(&self, state: &TestState) -> bool {
            *state != TestState::Done
        }

        async fn on_terminate(&mut self) {
            self.log.lock().push("terminate");
        }

        fn take_disposer(&mut self) -> Option<Disposer> {
            let log = Arc::clone(&self.log);
            Some(Box::new(move || log.lock().push("dispose")))
        }
    }

    fn setup(fault_policy: FaultPolicy, sink: ExceptionSink) -> (Arc<Control<Recorder>>, Arc<Runtime>) {
        let config = SchedulerConfig::builder()
            .clock(Arc::new(ManualClock::default()))
            .fault_policy(fault_policy)
            .loop_policy(LoopPolicy::Break)
            .sink(sink)
            .build()
            .unwrap();
        let spec = MachineSpec::<Recorder>::builder()
            .tag("recorder")
            .default_timeout(Duration::from_secs(1))
            .factory(|_| Recorder::default())
            .build()
            .unwrap();
        let runtime = Runtime::new(&config);
        (Control::new(spec, Arc::clone(&runtime)), runtime)
    }

    fn control(fault_policy: FaultPolicy, faults: Arc<AtomicUsize>) -> Arc<Control<Recorder>> {
        let sink = ExceptionSink::new(move |_| {
            faults.fetch_add(1, Ordering::SeqCst);
        });
        setup(fault_policy, sink).0
    }

    fn machine(control: &Control<Recorder>, id: u32) -> Arc<Machine<Recorder>> {
        control.get_or_create(id).unwrap();
        control.lookup(&id).unwrap()
    }

    #[tokio::test]
    async fn rerun_executes_new_state_before_returning() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let machine = machine(&control, 1);

        assert_eq!(machine.run_manual(Default::default()).await, RunOutcome::Completed);

        let inner = machine.inner().lock().await;
        assert_eq!(inner.logic.runs, vec![TestState::Idle, TestState::Working]);
        assert_eq!(inner.state, TestState::Working);
        assert_eq!(inner.runs, 1);
    }

    #[tokio::test]
    async fn guards_deny_transitions() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let machine = machine(&control, 1);
        let interface = machine.interface();

        assert_eq!(
            interface.change_state(TestState::Locked, false).await.unwrap(),
            ChangeOutcome::UnableToEnter
        );
        assert_eq!(
            interface.change_state(TestState::Done, false).await.unwrap(),
            ChangeOutcome::Success
        );
        assert_eq!(
            interface.change_state(TestState::Idle, false).await.unwrap(),
            ChangeOutcome::UnableToExit
        );
        assert_eq!(interface.state().await.unwrap(), TestState::Done);
    }

    #[tokio::test]
    async fn terminated_machine_rejects_everything() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let machine = machine(&control, 1);
        let interface = machine.interface();

        assert!(interface.terminate().await);
        assert!(!interface.terminate().await);
        assert!(interface.is_terminated());
        assert!(control.get(&1).is_none());
        assert_eq!(machine.run_manual(Default::default()).await, RunOutcome::Terminated);
        assert!(matches!(
            interface.send(&Cmd::Echo(1)),
            Err(PostError::Terminated { .. })
        ));
        let mut inner = machine.inner().lock().await;
        assert_eq!(
            machine.change_state_locked(&mut inner, TestState::Working, false),
            ChangeOutcome::Terminated
        );
    }

    #[tokio::test]
    async fn termination_hook_runs_before_disposer_outside_lock() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let machine = machine(&control, 1);
        let log = Arc::clone(&machine.inner().lock().await.logic.log);

        machine.interface().change_state(TestState::Done, false).await.unwrap();
        assert_eq!(machine.run_manual(Default::default()).await, RunOutcome::Terminated);

        assert_eq!(*log.lock(), vec!["terminate", "dispose"]);
        assert!(!machine.inner().is_held());
        assert!(control.is_empty());
    }

    #[tokio::test]
    async fn failing_run_is_reported_and_terminates() {
        let faults = Arc::new(AtomicUsize::new(0));
        let control = control(FaultPolicy::Terminate, Arc::clone(&faults));
        let machine = machine(&control, 1);
        machine.inner().lock().await.logic.fail_runs = true;

        assert_eq!(machine.run_manual(Default::default()).await, RunOutcome::Terminated);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert!(machine.is_terminated());
        assert!(!machine.flags().is_running());
    }

    #[tokio::test]
    async fn continue_policy_keeps_faulty_machine() {
        let faults = Arc::new(AtomicUsize::new(0));
        let control = control(FaultPolicy::Continue, Arc::clone(&faults));
        let machine = machine(&control, 1);
        machine.inner().lock().await.logic.fail_runs = true;

        assert_eq!(machine.run_manual(Default::default()).await, RunOutcome::Completed);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert!(!machine.is_terminated());
    }

    #[tokio::test]
    async fn two_way_command_replies_and_panics_are_contained() {
        let faults = Arc::new(AtomicUsize::new(0));
        let control = control(FaultPolicy::Continue, Arc::clone(&faults));
        let interface = control.get_or_create(7).unwrap();

        let reply = interface.ask(&Cmd::Echo(41), Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, 42);

        let result = interface.ask(&Cmd::Fail, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PostError::Dropped)));
        assert_eq!(faults.load(Ordering::SeqCst), 1);

        let moved = interface
            .ask(&Cmd::Move(TestState::Working), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(moved, ChangeOutcome::Success as u32);
        assert_eq!(interface.state().await.unwrap(), TestState::Working);
    }

    #[tokio::test]
    async fn process_marks_due_machine_queued_once() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let machine = machine(&control, 1);
        let now = machine.created_at() + chrono::Duration::seconds(2);

        assert_eq!(machine.process(now, Duration::from_secs(2)), Decision::Run);
        assert_eq!(machine.process(now, Duration::ZERO), Decision::Idle);
        machine.release_queue();
        assert_eq!(machine.process(now, Duration::ZERO), Decision::Run);
    }

    #[tokio::test]
    async fn paused_machine_is_not_dispatched() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let machine = machine(&control, 1);
        let now = machine.created_at() + chrono::Duration::seconds(2);

        machine.pause();
        assert_eq!(machine.process(now, Duration::from_secs(2)), Decision::Idle);
        machine.resume();
        assert_eq!(machine.process(now, Duration::ZERO), Decision::Run);
    }

    #[tokio::test]
    async fn command_can_terminate_through_its_context() {
        let (control, runtime) = setup(FaultPolicy::Terminate, ExceptionSink::log());
        let machine = machine(&control, 1);
        let log = Arc::clone(&machine.inner().lock().await.logic.log);

        let reply = machine.interface().ask(&Cmd::Stop, Duration::from_secs(1)).await;
        assert_eq!(reply.unwrap(), 1);
        runtime.wait_workers().await;

        assert!(machine.is_terminated());
        assert_eq!(*log.lock(), vec!["terminate", "dispose"]);
        assert!(control.is_empty());
    }

    #[tokio::test]
    async fn command_can_terminate_through_its_own_interface() {
        let (control, runtime) = setup(FaultPolicy::Terminate, ExceptionSink::log());
        let machine = machine(&control, 1);
        let log = Arc::clone(&machine.inner().lock().await.logic.log);

        let reply = machine.interface().ask(&Cmd::Quit, Duration::from_secs(1)).await;
        assert_eq!(reply.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(5), runtime.wait_workers())
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["terminate", "dispose"]);
        assert!(control.is_empty());
        assert!(!machine.inner().is_held());
    }

    #[tokio::test]
    async fn reading_own_state_through_interface_is_refused() {
        let (control, _runtime) = setup(FaultPolicy::Terminate, ExceptionSink::log());
        let interface = control.get_or_create(1).unwrap();

        assert_eq!(interface.ask(&Cmd::Peek, Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(interface.ask(&Cmd::Echo(1), Duration::from_secs(1)).await.unwrap(), 2);
        assert_eq!(interface.state().await.unwrap(), TestState::Idle);
    }

    #[tokio::test]
    async fn escalated_fault_resumes_after_teardown() {
        let (control, _runtime) = setup(FaultPolicy::Terminate, ExceptionSink::escalate());
        let machine = machine(&control, 1);
        let log = Arc::clone(&machine.inner().lock().await.logic.log);
        machine.inner().lock().await.logic.fail_runs = true;

        let running = Arc::clone(&machine);
        let result = tokio::spawn(async move { running.run_manual(Default::default()).await }).await;

        assert!(result.unwrap_err().is_panic());
        assert_eq!(*log.lock(), vec!["terminate", "dispose"]);
        assert!(machine.is_terminated());
        assert!(control.is_empty());
        assert!(!machine.inner().is_held());
    }

    #[tokio::test]
    async fn escalated_command_fault_keeps_mailbox_usable() {
        let (control, runtime) = setup(FaultPolicy::Continue, ExceptionSink::escalate());
        let interface = control.get_or_create(3).unwrap();

        let result = interface.ask(&Cmd::Fail, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PostError::Dropped)));
        runtime.wait_workers().await;

        assert_eq!(interface.ask(&Cmd::Echo(1), Duration::from_secs(1)).await.unwrap(), 2);
    }

    #[test]
    fn count_ignores_terminated_members() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let a = machine(&control, 1);
        machine(&control, 2);

        assert!(a.flags().mark_terminated());
        assert_eq!(control.len(), 1);
        assert_eq!(control.ids(), vec![2]);
    }

    #[test]
    fn serials_are_unique() {
        let control = control(FaultPolicy::Terminate, Arc::default());
        let a = machine(&control, 1);
        let b = machine(&control, 2);
        assert!(b.serial() > a.serial());
    }
}
