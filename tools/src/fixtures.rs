//! Sample contracts shared by the test-suites.

use qavm::code::DAppCode;
use qavm::exec::{CallError, Invocation};
use qavm::persist::class::{ClassDecl, FieldKind};
use qavm::persist::object::Value;

/// `Doubler` keeps one `Cell` behind a static and doubles its value on every call.
pub fn doubler() -> DAppCode {
    DAppCode::new(vec![
        ClassDecl::new("Cell").field("value", FieldKind::Long),
        ClassDecl::new("Doubler").static_field("cell", FieldKind::Reference),
    ])
}

pub fn doubler_init(
    start: i64,
) -> impl FnOnce(&mut Invocation) -> Result<i64, CallError> {
    move |inv| {
        let d = inv.dapp();
        let cell = d.new_object("Cell")?;
        cell.set_field("value", Value::Long(start))?;
        d.set_static("Doubler", "cell", Value::object(&cell))?;
        Ok(start)
    }
}

pub fn doubler_get(inv: &mut Invocation) -> Result<i64, CallError> {
    let cell = inv.dapp().get_static("Doubler", "cell")?;
    let cell = cell
        .as_object()
        .ok_or_else(|| CallError::Revert("no cell".into()))?;
    let v = cell.get_field("value")?;
    v.as_long()
        .ok_or_else(|| CallError::Revert("bad cell".into()))
}

pub fn doubler_double(inv: &mut Invocation) -> Result<i64, CallError> {
    let v = doubler_get(inv)? * 2;
    let cell = inv.dapp().get_static("Doubler", "cell")?;
    if let Some(cell) = cell.as_object() {
        cell.set_field("value", Value::Long(v))?;
    }
    Ok(v)
}

/// A singly linked list of `Node`s whose head sits in `List.head`.
pub fn linked_list() -> DAppCode {
    DAppCode::new(vec![
        ClassDecl::new("Node")
            .field("value", FieldKind::Int)
            .field("next", FieldKind::Reference),
        ClassDecl::new("List")
            .static_field("head", FieldKind::Reference)
            .static_field("size", FieldKind::Int),
    ])
}

pub fn list_push(
    value: i32,
) -> impl FnOnce(&mut Invocation) -> Result<i32, CallError> {
    move |inv| {
        let d = inv.dapp();
        let node = d.new_object("Node")?;
        node.set_field("value", Value::Int(value))?;
        node.set_field("next", d.get_static("List", "head")?)?;
        d.set_static("List", "head", Value::object(&node))?;
        let size = d.get_static("List", "size")?.as_int().unwrap_or(0) + 1;
        d.set_static("List", "size", Value::Int(size))?;
        Ok(size)
    }
}

/// Values from head to tail.
pub fn list_values(inv: &mut Invocation) -> Result<Vec<i32>, CallError> {
    let mut out = Vec::new();
    let mut cur = inv.dapp().get_static("List", "head")?;
    while let Some(node) = cur.as_object().cloned() {
        out.push(node.get_field("value")?.as_int().unwrap_or(0));
        cur = node.get_field("next")?;
    }
    Ok(out)
}

/// Two-level hierarchy where both levels declare a field named `id`.
pub fn shapes() -> DAppCode {
    DAppCode::new(vec![
        ClassDecl::new("Shape")
            .field("id", FieldKind::Long)
            .field("visible", FieldKind::Boolean),
        ClassDecl::new("Circle")
            .extends("Shape")
            .field("id", FieldKind::Int)
            .field("radius", FieldKind::Double)
            .field("center", FieldKind::Reference),
        ClassDecl::new("Point")
            .field("x", FieldKind::Int)
            .field("y", FieldKind::Int),
        ClassDecl::new("Canvas")
            .static_field("shapes", FieldKind::Reference)
            .static_field("origin", FieldKind::Reference),
    ])
}
