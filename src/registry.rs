//! Explicit registration of machine types.
//!
//! Every machine type the scheduler hosts is registered up front with its
//! [`MachineSpec`]. The registry is consumed by [`crate::BigMachine::new`],
//! which creates one control per entry.

use crate::builder::{BuildError, MachineSpec};
use crate::control::{Control, ControlKind, ErasedControl, Schedule};
use crate::machine::MachineLogic;
use crate::runtime::Runtime;
use indexmap::IndexMap;
use serde::Serialize;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Static description of a registered machine type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineMeta {
    pub tag: &'static str,
    pub type_name: &'static str,
    pub kind: ControlKind,
    pub schedule: Schedule,
    pub persistent: bool,
    pub default_timeout: Duration,
    pub lifespan: Option<Duration>,
}

impl MachineMeta {
    pub(crate) fn of<L: MachineLogic>(spec: &MachineSpec<L>) -> Self {
        Self {
            tag: spec.tag(),
            type_name: std::any::type_name::<L>(),
            kind: spec.kind(),
            schedule: spec.schedule(),
            persistent: spec.is_persistent(),
            default_timeout: spec.default_timeout(),
            lifespan: spec.lifespan(),
        }
    }
}

type Instantiate = Box<dyn FnOnce(Arc<Runtime>) -> Arc<dyn ErasedControl> + Send + Sync>;

pub(crate) struct Entry {
    pub(crate) meta: MachineMeta,
    pub(crate) instantiate: Instantiate,
}

/// The set of machine types a scheduler hosts.
#[derive(Default)]
pub struct MachineRegistry {
    entries: IndexMap<TypeId, Entry>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `L`. Each type and each tag may be registered once.
    pub fn register<L: MachineLogic>(&mut self, spec: MachineSpec<L>) -> Result<&mut Self, BuildError> {
        let meta = MachineMeta::of(&spec);
        if self.entries.contains_key(&TypeId::of::<L>()) {
            return Err(BuildError::DuplicateType {
                type_name: meta.type_name,
            });
        }
        if self.lookup_tag(meta.tag).is_some() {
            return Err(BuildError::DuplicateTag { tag: meta.tag });
        }
        self.entries.insert(
            TypeId::of::<L>(),
            Entry {
                meta,
                instantiate: Box::new(move |runtime| -> Arc<dyn ErasedControl> {
                    Control::new(spec, runtime)
                }),
            },
        );
        Ok(self)
    }

    /// Builder-style variant of [`MachineRegistry::register`].
    pub fn with<L: MachineLogic>(mut self, spec: MachineSpec<L>) -> Result<Self, BuildError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn lookup<L: MachineLogic>(&self) -> Option<&MachineMeta> {
        self.entries.get(&TypeId::of::<L>()).map(|entry| &entry.meta)
    }

    pub fn lookup_tag(&self, tag: &str) -> Option<&MachineMeta> {
        self.metas().find(|meta| meta.tag == tag)
    }

    /// Metadata in registration order.
    pub fn metas(&self) -> impl Iterator<Item = &MachineMeta> {
        self.entries.values().map(|entry| &entry.meta)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (TypeId, Entry)> {
        self.entries.into_iter()
    }
}

impl fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.metas()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Flow, MachineCx};
    use crate::sink::BoxError;
    use async_trait::async_trait;

    crate::state_enum! {
        enum TestState {
            Only,
        }
        initial: Only
    }

    struct Alpha;
    struct Beta;

    macro_rules! trivial_logic {
        ($name:ident) => {
            #[async_trait]
            impl MachineLogic for $name {
                type Id = u32;
                type State = TestState;
                type Command = ();
                type Reply = ();

                fn initial_state(&self) -> TestState {
                    TestState::Only
                }

                async fn run_state(_: &mut MachineCx<'_, Self>) -> Result<Flow, BoxError> {
                    Ok(Flow::Continue)
                }

                async fn on_command(_: &mut MachineCx<'_, Self>, _: ()) -> Result<(), BoxError> {
                    Ok(())
                }
            }
        };
    }

    trivial_logic!(Alpha);
    trivial_logic!(Beta);

    fn alpha(tag: &'static str) -> MachineSpec<Alpha> {
        MachineSpec::builder().tag(tag).factory(|_| Alpha).build().unwrap()
    }

    fn beta(tag: &'static str) -> MachineSpec<Beta> {
        MachineSpec::builder().tag(tag).sequential().factory(|_| Beta).build().unwrap()
    }

    #[test]
    fn registers_and_looks_up_by_type_and_tag() {
        let registry = MachineRegistry::new()
            .with(alpha("alpha"))
            .unwrap()
            .with(beta("beta"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup::<Alpha>().unwrap().tag, "alpha");
        assert_eq!(registry.lookup_tag("beta").unwrap().kind, ControlKind::Sequential);
        assert!(registry.lookup_tag("gamma").is_none());
    }

    #[test]
    fn rejects_duplicate_type() {
        let mut registry = MachineRegistry::new();
        registry.register(alpha("alpha")).unwrap();

        let result = registry.register(alpha("other"));
        assert!(matches!(result, Err(BuildError::DuplicateType { .. })));
    }

    #[test]
    fn rejects_duplicate_tag() {
        let mut registry = MachineRegistry::new();
        registry.register(alpha("shared")).unwrap();

        let result = registry.register(beta("shared"));
        assert!(matches!(result, Err(BuildError::DuplicateTag { tag: "shared" })));
    }
}
