//! Macros for ergonomic state definitions.

/// Generate a state enum together with its `State` implementation.
///
/// The enum derives `Copy`, `Eq`, `Hash` and the serde traits. An optional
/// `initial:` clause implements `Default` for the named variant.
///
/// # Example
///
/// ```
/// use bigmachine::state_enum;
/// use bigmachine::core::State;
///
/// state_enum! {
///     pub enum Door {
///         Closed,
///         Open,
///         Locked,
///     }
///     initial: Closed
/// }
///
/// assert_eq!(Door::default(), Door::Closed);
/// assert_eq!(Door::Locked.name(), "Locked");
/// ```
#[macro_export]
macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident
            ),* $(,)?
        }

        $(initial: $initial:ident)?
    ) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize,
        )]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant
            ),*
        }

        impl $crate::core::State for $name {
            fn name(&self) -> &str {
                match self {
                    $(Self::$variant => stringify!($variant)),*
                }
            }
        }

        $(
            impl Default for $name {
                fn default() -> Self {
                    Self::$initial
                }
            }
        )?
    };
}

#[cfg(test)]
mod tests {
    use crate::core::State;

    state_enum! {
        enum TestState {
            Initial,
            Processing,
            Complete,
        }
        initial: Initial
    }

    #[test]
    fn state_enum_macro_generates_trait() {
        let state = TestState::Initial;
        assert_eq!(state.name(), "Initial");
        assert_eq!(TestState::Complete.name(), "Complete");
        assert_eq!(TestState::default(), TestState::Initial);
    }

    #[test]
    fn state_enum_supports_visibility() {
        state_enum! {
            pub enum PublicState {
                A,
                B,
            }
        }

        let state = PublicState::B;
        let copy = state;
        assert_eq!(state, copy);
    }

    #[test]
    fn state_enum_is_serializable() {
        let bytes = bincode::serialize(&TestState::Processing).unwrap();
        let back: TestState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, TestState::Processing);
    }
}
