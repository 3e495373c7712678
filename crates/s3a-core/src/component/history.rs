//! Undoable component edits.
//!
//! Each wrapper performs the edit on the table and records the resulting
//! [`TableChange`] on the stack. Edits that change nothing are not
//! recorded.

use crate::component::{Component, ComponentError, ComponentTable, InstanceId, TableChange};
use crate::geometry::ComplexXYVertices;
use crate::undo::{Action, ActionError, ActionStack, StackError};

/// Undo history for a [`ComponentTable`].
pub type TableHistory = ActionStack<ComponentTable>;

impl Action<ComponentTable> for TableChange {
    fn apply(&mut self, state: &mut ComponentTable) -> Result<(), ActionError> {
        state.apply_change(self);
        Ok(())
    }

    fn revert(&mut self, state: &mut ComponentTable) -> Result<(), ActionError> {
        state.revert_change(self);
        Ok(())
    }
}

fn record(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    description: &str,
    edit: impl FnOnce(&mut ComponentTable) -> Result<TableChange, ComponentError>,
) -> Result<TableChange, StackError> {
    let change = edit(table).map_err(|err| StackError::Action {
        description: description.to_owned(),
        source: Box::new(err),
    })?;
    remember(stack, description, &change);
    Ok(change)
}

fn remember(stack: &mut TableHistory, description: &str, change: &TableChange) {
    if !change.is_empty() {
        stack.push(description, change.clone());
    }
}

/// Undoable [`ComponentTable::add`]; returns the new IDs.
pub fn add(stack: &mut TableHistory, table: &mut ComponentTable, components: Vec<Component>) -> Vec<InstanceId> {
    let change = table.add(components);
    remember(stack, "Add Components", &change);
    change.added_ids()
}

/// Undoable [`ComponentTable::add_with_ids`].
pub fn add_with_ids(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    components: Vec<Component>,
) -> TableChange {
    let change = table.add_with_ids(components);
    remember(stack, "Add Components", &change);
    change
}

/// Undoable [`ComponentTable::remove`].
///
/// # Errors
///
/// Returns [`StackError::Action`] wrapping the table error.
pub fn remove(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    ids: &[InstanceId],
) -> Result<TableChange, StackError> {
    record(stack, table, "Remove Components", |t| t.remove(ids))
}

/// Undoable [`ComponentTable::update_vertices`].
///
/// # Errors
///
/// Returns [`StackError::Action`] wrapping the table error.
pub fn update_vertices(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    id: InstanceId,
    vertices: ComplexXYVertices,
) -> Result<TableChange, StackError> {
    record(stack, table, "Modify Component", |t| t.update_vertices(id, vertices))
}

/// Undoable [`ComponentTable::clear`].
pub fn clear(stack: &mut TableHistory, table: &mut ComponentTable) -> TableChange {
    let change = table.clear();
    remember(stack, "Clear Components", &change);
    change
}

/// Undoable [`ComponentTable::merge`].
///
/// # Errors
///
/// Returns [`StackError::Action`] wrapping the table error.
pub fn merge(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    ids: &[InstanceId],
    keep: Option<InstanceId>,
) -> Result<TableChange, StackError> {
    record(stack, table, "Merge Components", |t| t.merge(ids, keep))
}

/// Undoable [`ComponentTable::split`].
///
/// # Errors
///
/// Returns [`StackError::Action`] wrapping the table error.
pub fn split(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    id: InstanceId,
) -> Result<TableChange, StackError> {
    record(stack, table, "Split Component", |t| t.split(id))
}

/// Undoable [`ComponentTable::remove_overlap`].
///
/// # Errors
///
/// Returns [`StackError::Action`] wrapping the table error.
pub fn remove_overlap(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    ids: &[InstanceId],
) -> Result<TableChange, StackError> {
    record(stack, table, "Remove Overlap", |t| t.remove_overlap(ids))
}

/// Undoable [`ComponentTable::create_from_roi`].
///
/// # Errors
///
/// Returns [`StackError::Action`] wrapping the table error.
pub fn create_from_roi(
    stack: &mut TableHistory,
    table: &mut ComponentTable,
    roi: &ComplexXYVertices,
    min_area: f64,
    epsilon: f64,
) -> Result<TableChange, StackError> {
    record(stack, table, "Create Component", |t| t.create_from_roi(roi, min_area, epsilon))
}
