//! Symbol resolution: the precedence rules that decide which definition wins
//! when the same name arrives from several inputs.
//!
//! `resolve` is a pure function over the existing and incoming records;
//! `SymbolTable::insert_global` applies its verdict to the table. The rules
//! are the ELF ones:
//!
//! 1. undefined vs defined: defined wins
//! 2. strong vs weak: strong wins, regardless of order
//! 3. strong vs strong: error, unless multiple definitions are allowed
//! 4. common vs common: first wins, taking the larger size and alignment
//! 5. common vs defined: defined wins
//! 6. shared-object definitions only satisfy undefined references and never
//!    displace a regular definition, weak included

use crate::error::LinkError;
use crate::input::Input;
use crate::module::SymbolId;
use crate::symbol::{Binding, ResolveInfo, SymbolDesc, SymbolTable};

/// Verdict of comparing an existing record with an incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    KeepOld,
    Override,
    Merge,
    Conflict,
}

/// Decide between an existing record and an incoming one for the same name.
pub fn resolve(old: &ResolveInfo, new: &ResolveInfo) -> ResolveAction {
    // Shared-object definitions only ever fill holes.
    if new.is_dyn {
        return if old.is_undef() {
            ResolveAction::Override
        } else {
            ResolveAction::KeepOld
        };
    }
    if old.is_dyn {
        return if new.is_undef() {
            ResolveAction::KeepOld
        } else {
            // A regular definition (or common) displaces the shared one.
            ResolveAction::Override
        };
    }

    match (old.desc, new.desc) {
        (SymbolDesc::Undefined, SymbolDesc::Undefined) => {
            // References only; remember the strongest binding seen.
            if old.binding == Binding::Weak && new.binding != Binding::Weak {
                ResolveAction::Override
            } else {
                ResolveAction::KeepOld
            }
        }
        (SymbolDesc::Undefined, _) => ResolveAction::Override,
        (_, SymbolDesc::Undefined) => ResolveAction::KeepOld,

        (SymbolDesc::Common, SymbolDesc::Common) => ResolveAction::Merge,
        (SymbolDesc::Common, SymbolDesc::Define) => {
            if new.binding == Binding::Weak {
                // A weak definition does not displace a tentative one.
                ResolveAction::KeepOld
            } else {
                ResolveAction::Override
            }
        }
        (SymbolDesc::Define, SymbolDesc::Common) => ResolveAction::KeepOld,

        (SymbolDesc::Define, SymbolDesc::Define) => {
            match (old.binding, new.binding) {
                (Binding::Weak, Binding::Global) => ResolveAction::Override,
                (_, Binding::Weak) => ResolveAction::KeepOld,
                (Binding::Weak, _) => ResolveAction::Override,
                _ => ResolveAction::Conflict,
            }
        }

        // Indirect records alias another definition and never lose to later
        // arrivals; new records are never created Indirect.
        (SymbolDesc::Indirect, _) => ResolveAction::KeepOld,
        (_, SymbolDesc::Indirect) => ResolveAction::KeepOld,
    }
}

impl SymbolTable {
    /// Run `incoming` through resolution against the table.
    ///
    /// Returns the record id and the action taken. `Conflict` is downgraded
    /// to keep-first when `allow_multiple` is set; otherwise it is a
    /// `MultipleDefinition` error naming both defining inputs.
    pub fn insert_global(
        &mut self,
        incoming: ResolveInfo,
        allow_multiple: bool,
        inputs: &[Input],
    ) -> Result<(SymbolId, ResolveAction), LinkError> {
        let existed = self.lookup(&incoming.name).is_some();
        let id = self.declare(&incoming.name);
        if !existed {
            // First arrival: the fresh placeholder carries no information,
            // the incoming record becomes the truth as-is.
            *self.get_mut(id) = incoming;
            return Ok((id, ResolveAction::Override));
        }
        let action = resolve(self.get(id), &incoming);
        match action {
            ResolveAction::KeepOld => {}
            ResolveAction::Override => {
                let old = self.get_mut(id);
                let reserved = old.reserved;
                *old = incoming;
                // Reservation state is per-name and survives whichever
                // definition wins.
                old.reserved = reserved;
            }
            ResolveAction::Merge => {
                let old = self.get_mut(id);
                old.size = old.size.max(incoming.size);
                // Common records carry their alignment in `value`.
                old.value = old.value.max(incoming.value);
            }
            ResolveAction::Conflict => {
                if !allow_multiple {
                    let old = self.get(id);
                    let name_of = |src: Option<crate::module::InputId>| {
                        src.map(|i| inputs[i.index()].name.clone())
                            .unwrap_or_else(|| "<internal>".to_string())
                    };
                    return Err(LinkError::MultipleDefinition {
                        name: incoming.name,
                        first: name_of(old.source),
                        second: name_of(incoming.source),
                    });
                }
                log::debug!(
                    "allowing duplicate definition of `{}', keeping the first",
                    incoming.name
                );
            }
        }
        Ok((id, action))
    }
}
