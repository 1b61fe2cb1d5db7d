//! Builder for per-type machine registrations.

use crate::builder::error::BuildError;
use crate::control::{ControlKind, Schedule};
use crate::machine::MachineLogic;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout of a timer machine: run once per second.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type Factory<L> = Arc<dyn Fn(&<L as MachineLogic>::Id) -> L + Send + Sync>;

type Image<L> = (
    <L as MachineLogic>::Id,
    <L as MachineLogic>::State,
    L,
);

/// Encodes and decodes the `(identifier, state, logic)` image of a machine.
pub(crate) struct Codec<L: MachineLogic> {
    pub(crate) encode: fn(&L::Id, &L::State, &L) -> Result<Vec<u8>, bincode::Error>,
    pub(crate) decode: fn(&[u8]) -> Result<Image<L>, bincode::Error>,
}

impl<L: MachineLogic> Clone for Codec<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: MachineLogic> Copy for Codec<L> {}

fn encode_image<L>(id: &L::Id, state: &L::State, logic: &L) -> Result<Vec<u8>, bincode::Error>
where
    L: MachineLogic + Serialize,
    L::Id: Serialize,
{
    bincode::serialize(&(id, state, logic))
}

fn decode_image<L>(bytes: &[u8]) -> Result<Image<L>, bincode::Error>
where
    L: MachineLogic + DeserializeOwned,
    L::Id: DeserializeOwned,
{
    bincode::deserialize(bytes)
}

/// How the scheduler should host one machine type.
pub struct MachineSpec<L: MachineLogic> {
    pub(crate) tag: &'static str,
    pub(crate) kind: ControlKind,
    pub(crate) schedule: Schedule,
    pub(crate) default_timeout: Duration,
    pub(crate) lifespan: Option<Duration>,
    pub(crate) factory: Factory<L>,
    pub(crate) codec: Option<Codec<L>>,
}

impl<L: MachineLogic> MachineSpec<L> {
    pub fn builder() -> MachineSpecBuilder<L> {
        MachineSpecBuilder::new()
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn kind(&self) -> ControlKind {
        self.kind
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn lifespan(&self) -> Option<Duration> {
        self.lifespan
    }

    pub fn is_persistent(&self) -> bool {
        self.codec.is_some()
    }
}

impl<L: MachineLogic> fmt::Debug for MachineSpec<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineSpec")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("schedule", &self.schedule)
            .field("default_timeout", &self.default_timeout)
            .field("lifespan", &self.lifespan)
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

/// Fluent builder for [`MachineSpec`].
///
/// # Example
///
/// ```rust,ignore
/// let spec = MachineSpec::<Heater>::builder()
///     .tag("heater")
///     .sequential()
///     .default_timeout(Duration::from_millis(250))
///     .factory(|id| Heater::new(*id))
///     .build()?;
/// ```
pub struct MachineSpecBuilder<L: MachineLogic> {
    tag: Option<&'static str>,
    kind: ControlKind,
    schedule: Schedule,
    default_timeout: Duration,
    lifespan: Option<Duration>,
    factory: Option<Factory<L>>,
    codec: Option<Codec<L>>,
    _logic: PhantomData<fn() -> L>,
}

impl<L: MachineLogic> MachineSpecBuilder<L> {
    pub fn new() -> Self {
        Self {
            tag: None,
            kind: ControlKind::Unordered,
            schedule: Schedule::Timer,
            default_timeout: DEFAULT_TIMEOUT,
            lifespan: None,
            factory: None,
            codec: None,
            _logic: PhantomData,
        }
    }

    /// Type tag used in logs, loop-detector messages and snapshot records
    /// (required).
    pub fn tag(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn kind(mut self, kind: ControlKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn sequential(self) -> Self {
        self.kind(ControlKind::Sequential)
    }

    pub fn single(self) -> Self {
        self.kind(ControlKind::Single)
    }

    /// Runs the machines in a tight loop on the continuous pool instead of
    /// on the timer.
    pub fn continuous(mut self) -> Self {
        self.schedule = Schedule::Continuous;
        self
    }

    /// Timeout re-armed after every run. Zero means run once, then stay
    /// dormant until triggered.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    /// Constructs the logic of a newly created machine (required).
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&L::Id) -> L + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Includes the machines of this type in snapshots.
    pub fn persistent(mut self) -> Self
    where
        L: Serialize + DeserializeOwned,
        L::Id: Serialize + DeserializeOwned,
    {
        self.codec = Some(Codec {
            encode: encode_image::<L>,
            decode: decode_image::<L>,
        });
        self
    }

    pub fn build(self) -> Result<MachineSpec<L>, BuildError> {
        let tag = self.tag.ok_or(BuildError::MissingTag)?;
        let factory = self.factory.ok_or(BuildError::MissingFactory { tag })?;

        if self.schedule == Schedule::Continuous && self.kind == ControlKind::Sequential {
            return Err(BuildError::ContinuousSequential { tag });
        }

        Ok(MachineSpec {
            tag,
            kind: self.kind,
            schedule: self.schedule,
            default_timeout: self.default_timeout,
            lifespan: self.lifespan,
            factory,
            codec: self.codec,
        })
    }
}

impl<L: MachineLogic> Default for MachineSpecBuilder<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Flow, MachineCx};
    use crate::sink::BoxError;
    use async_trait::async_trait;
    use serde::Deserialize;

    crate::state_enum! {
        enum TestState {
            Idle,
            Busy,
        }
        initial: Idle
    }

    #[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
    struct Counter {
        hits: u32,
    }

    #[async_trait]
    impl MachineLogic for Counter {
        type Id = String;
        type State = TestState;
        type Command = ();
        type Reply = u32;

        fn initial_state(&self) -> TestState {
            TestState::default()
        }

        async fn run_state(cx: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError> {
            cx.hits += 1;
            Ok(Flow::Continue)
        }

        async fn on_command(cx: &mut MachineCx<'_, Self>, _: ()) -> Result<u32, BoxError> {
            Ok(cx.hits)
        }
    }

    #[test]
    fn builder_validates_required_fields() {
        let result = MachineSpec::<Counter>::builder().build();
        assert!(matches!(result, Err(BuildError::MissingTag)));

        let result = MachineSpec::<Counter>::builder().tag("counter").build();
        assert!(matches!(result, Err(BuildError::MissingFactory { tag: "counter" })));
    }

    #[test]
    fn builder_applies_defaults() {
        let spec = MachineSpec::<Counter>::builder()
            .tag("counter")
            .factory(|_| Counter::default())
            .build()
            .unwrap();

        assert_eq!(spec.kind(), ControlKind::Unordered);
        assert_eq!(spec.schedule(), Schedule::Timer);
        assert_eq!(spec.default_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(spec.lifespan(), None);
        assert!(!spec.is_persistent());
    }

    #[test]
    fn continuous_sequential_is_rejected() {
        let result = MachineSpec::<Counter>::builder()
            .tag("counter")
            .sequential()
            .continuous()
            .factory(|_| Counter::default())
            .build();

        assert!(matches!(result, Err(BuildError::ContinuousSequential { .. })));
    }

    #[test]
    fn persistent_codec_round_trips_image() {
        let spec = MachineSpec::<Counter>::builder()
            .tag("counter")
            .factory(|_| Counter::default())
            .persistent()
            .build()
            .unwrap();
        let codec = spec.codec.unwrap();

        let bytes = (codec.encode)(&"a".to_string(), &TestState::Busy, &Counter { hits: 7 }).unwrap();
        let (id, state, logic) = (codec.decode)(&bytes).unwrap();

        assert_eq!(id, "a");
        assert_eq!(state, TestState::Busy);
        assert_eq!(logic, Counter { hits: 7 });
    }
}
