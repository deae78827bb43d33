// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

/// The kinds of filesystem change we track for a watched tree.
///
/// `None` is the tombstone for a delay that was logically removed
/// by a collapse; it never arrives from the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Attrib,
    Modify,
    Create,
    Delete,
    Move,
    MoveFrom,
    MoveTo,
    None,
}

impl EventKind {
    /// Parse one of the exact wire names. Anything else is rejected
    /// with `None`; the tombstone kind is not a wire name.
    pub fn from_wire(name: &str) -> Option<EventKind> {
        match name {
            "Attrib" => Some(EventKind::Attrib),
            "Modify" => Some(EventKind::Modify),
            "Create" => Some(EventKind::Create),
            "Delete" => Some(EventKind::Delete),
            "Move" => Some(EventKind::Move),
            "MoveFrom" => Some(EventKind::MoveFrom),
            "MoveTo" => Some(EventKind::MoveTo),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Attrib => "Attrib",
            EventKind::Modify => "Modify",
            EventKind::Create => "Create",
            EventKind::Delete => "Delete",
            EventKind::Move => "Move",
            EventKind::MoveFrom => "MoveFrom",
            EventKind::MoveTo => "MoveTo",
            EventKind::None => "None",
        }
    }

    /// Move events never collapse, they only stack.
    pub fn is_move(self) -> bool {
        matches!(self, EventKind::Move | EventKind::MoveFrom | EventKind::MoveTo)
    }

    // Index into the collapse table. Only the four non-move,
    // non-tombstone kinds are addressable.
    fn table_index(self) -> Option<usize> {
        match self {
            EventKind::Attrib => Some(0),
            EventKind::Modify => Some(1),
            EventKind::Create => Some(2),
            EventKind::Delete => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What happens when a new event lands on a path that already has
/// a pending delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The older delay's kind is rewritten in place; the newer event
    /// is dropped. The older delay keeps its deadline and position.
    Replace(EventKind),
    /// The two events void each other; the older delay is tombstoned
    /// and the newer event is dropped.
    Cancel,
    /// Both are kept, the newer one queued after the older.
    Stack,
}

/// Total mapping `(older kind, newer kind) -> Outcome` over the four
/// non-move kinds. Pairs involving a move kind are forced to stack
/// before the table is ever consulted.
#[derive(Debug, Clone)]
pub struct CollapseTable {
    cells: [[Outcome; 4]; 4],
}

impl CollapseTable {
    pub fn lookup(&self, old: EventKind, new: EventKind) -> Outcome {
        if old.is_move() || new.is_move() {
            return Outcome::Stack;
        }
        let (Some(o), Some(n)) = (old.table_index(), new.table_index()) else {
            // A tombstoned delay is never consulted and the watcher
            // never produces one, so reaching this is a bug.
            panic!("collapse lookup on unaddressable kinds {old}/{new}");
        };
        self.cells[o][n]
    }

    /// Override a single cell. Panics on move or tombstone kinds,
    /// which are not part of the table.
    pub fn set(&mut self, old: EventKind, new: EventKind, outcome: Outcome) {
        let (Some(o), Some(n)) = (old.table_index(), new.table_index()) else {
            panic!("collapse table cells exist only for non-move kinds, got {old}/{new}");
        };
        self.cells[o][n] = outcome;
    }
}

impl Default for CollapseTable {
    fn default() -> Self {
        use EventKind::{Attrib, Create, Delete, Modify};
        use Outcome::{Cancel, Replace};
        // Rows are the older kind, columns the newer, in
        // Attrib/Modify/Create/Delete order.
        CollapseTable {
            cells: [
                [Replace(Attrib), Replace(Modify), Replace(Create), Replace(Delete)],
                [Replace(Modify), Replace(Modify), Replace(Create), Replace(Delete)],
                [Replace(Create), Replace(Create), Replace(Create), Cancel],
                [Replace(Delete), Replace(Delete), Replace(Modify), Replace(Delete)],
            ],
        }
    }
}
