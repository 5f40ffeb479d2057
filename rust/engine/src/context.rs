//! Per-process view of held channels, rebuilt from the ledger each step.

use std::collections::BTreeMap;

use parley_types::{Placeholder, TypeKey};

use crate::error::{BindingError, EngineResult};
use crate::ledger::{BindingEntry, Role};

/// One held channel end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub role: Role,
    pub state: TypeKey,
}

/// Liabilities (provider ends) and assets (client ends) of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    resources: BTreeMap<Placeholder, Resource>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context of the live rows among `rows`.
    pub fn from_bindings<'a>(rows: impl IntoIterator<Item = &'a BindingEntry>) -> Self {
        let resources = rows
            .into_iter()
            .filter(|row| row.is_live())
            .map(|row| {
                (
                    row.placeholder.clone(),
                    Resource {
                        role: row.role,
                        state: row.state,
                    },
                )
            })
            .collect();
        Self { resources }
    }

    #[must_use]
    pub fn get(&self, placeholder: &Placeholder) -> Option<Resource> {
        self.resources.get(placeholder).copied()
    }

    /// # Errors
    ///
    /// `UnboundPlaceholder` if nothing is held under `placeholder`.
    pub fn require(&self, placeholder: &Placeholder) -> EngineResult<Resource> {
        self.get(placeholder).ok_or_else(|| {
            BindingError::UnboundPlaceholder {
                placeholder: placeholder.clone(),
            }
            .into()
        })
    }

    #[must_use]
    pub fn contains(&self, placeholder: &Placeholder) -> bool {
        self.resources.contains_key(placeholder)
    }

    /// Bind a fresh name.
    ///
    /// # Errors
    ///
    /// `DuplicatePlaceholder` if the name is already held.
    pub fn introduce(&mut self, placeholder: Placeholder, resource: Resource) -> EngineResult<()> {
        if self.resources.contains_key(&placeholder) {
            return Err(BindingError::DuplicatePlaceholder { placeholder }.into());
        }
        self.resources.insert(placeholder, resource);
        Ok(())
    }

    /// Advance a held channel to a new state.
    pub fn advance(&mut self, placeholder: &Placeholder, state: TypeKey) {
        if let Some(resource) = self.resources.get_mut(placeholder) {
            resource.state = state;
        }
    }

    pub fn discharge(&mut self, placeholder: &Placeholder) -> Option<Resource> {
        self.resources.remove(placeholder)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Held names other than `keep`.
    #[must_use]
    pub fn others(&self, keep: &[&Placeholder]) -> Vec<Placeholder> {
        self.resources
            .keys()
            .filter(|name| !keep.contains(name))
            .cloned()
            .collect()
    }

    pub fn liabilities(&self) -> impl Iterator<Item = (&Placeholder, TypeKey)> {
        self.by_role(Role::Provider)
    }

    pub fn assets(&self) -> impl Iterator<Item = (&Placeholder, TypeKey)> {
        self.by_role(Role::Client)
    }

    fn by_role(&self, role: Role) -> impl Iterator<Item = (&Placeholder, TypeKey)> {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource.role == role)
            .map(|(name, resource)| (name, resource.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChannelId, ProcessId};
    use crate::ledger::BindingEvent;
    use parley_types::{key_of, SessionType};
    use uuid::Uuid;

    fn row(name: &'static str, role: Role, event: BindingEvent) -> BindingEntry {
        BindingEntry {
            process_id: ProcessId(Uuid::from_u128(1)),
            placeholder: Placeholder::from_static(name),
            channel_id: ChannelId(Uuid::from_u128(9)),
            role,
            state: key_of(&SessionType::Unit),
            event,
        }
    }

    #[test]
    fn test_context_splits_liabilities_and_assets() {
        let rows = [
            row("r", Role::Provider, BindingEvent::Bound(1)),
            row("a", Role::Client, BindingEvent::Bound(2)),
            row("gone", Role::Client, BindingEvent::Consumed(2)),
        ];
        let ctx = Context::from_bindings(&rows);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.liabilities().count(), 1);
        assert_eq!(ctx.assets().map(|(n, _)| n.as_str()).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(ctx.others(&[&Placeholder::from_static("r")]), vec![Placeholder::from_static("a")]);
    }

    #[test]
    fn test_introduce_rejects_duplicates() {
        let mut ctx = Context::new();
        let res = Resource {
            role: Role::Client,
            state: key_of(&SessionType::Unit),
        };
        ctx.introduce(Placeholder::from_static("y"), res).unwrap();
        assert!(ctx.introduce(Placeholder::from_static("y"), res).is_err());
    }
}
