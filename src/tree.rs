/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The in-memory mirror of a peer's Ember+ tree: owned nodes, number-indexed
//! children, path resolution, and in-place merge of decoded response fragments.

use crate::{
    error::{EmberError, EmberResult},
    glow::{
        Command, CommandOptions, Connection, ConnectionCollection, ConnectionDisposition,
        ConnectionOperation, Element as GlowElement, FieldFlags, FunctionContents, Invocation,
        Label, MatrixAddressingMode, MatrixContents, MatrixType, MinMax, NodeContents,
        ParameterAccess, ParameterContents, ParameterType, ParametersLocation, PackedNumbers,
        QualifiedFunction, QualifiedMatrix, QualifiedNode, QualifiedParameter, QualifiedTemplate,
        Root, RootElement, RootElementCollection, StreamCollection, StreamDescription, Tuple,
        TupleDescription, TupleItemDescription, Value,
    },
};
use rasn::types::ObjectIdentifier;
use std::collections::{BTreeMap, HashMap};

pub(crate) fn oid(path: &[i32]) -> ObjectIdentifier {
    ObjectIdentifier::new(path.iter().map(|&n| n as u32).collect())
        .expect("a non-empty path is a valid object identifier")
}

pub(crate) fn oid_to_path(id: &ObjectIdentifier) -> Vec<i32> {
    id.iter().map(|&n| n as i32).collect()
}

/// An ordered, number-indexed set of sibling elements.
#[derive(Debug, Clone, Default)]
pub struct Children {
    order: Vec<Element>,
    index: HashMap<i32, usize>,
}

impl Children {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: Element) -> EmberResult<()> {
        let number = element.number();
        if self.index.contains_key(&number) {
            return Err(EmberError::DuplicateNumber(number));
        }
        self.index.insert(number, self.order.len());
        self.order.push(element);
        Ok(())
    }

    pub fn get(&self, number: i32) -> Option<&Element> {
        self.index.get(&number).map(|&i| &self.order[i])
    }

    pub fn get_mut(&mut self, number: i32) -> Option<&mut Element> {
        self.index.get(&number).map(|&i| &mut self.order[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn entry_or_insert(&mut self, number: i32, make: impl FnOnce() -> Element) -> &mut Element {
        if !self.index.contains_key(&number) {
            self.index.insert(number, self.order.len());
            self.order.push(make());
        }
        let idx = self.index[&number];
        &mut self.order[idx]
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub number: i32,
    pub identifier: Option<String>,
    pub description: Option<String>,
    pub is_online: Option<bool>,
    pub schema_identifiers: Option<String>,
    pub children: Children,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterData {
    pub number: i32,
    pub identifier: Option<String>,
    pub description: Option<String>,
    pub value: Option<Value>,
    pub minimum: Option<MinMax>,
    pub maximum: Option<MinMax>,
    pub access: Option<ParameterAccess>,
    pub format: Option<String>,
    pub enumeration: Option<String>,
    pub factor: Option<i32>,
    pub is_online: Option<bool>,
    pub formula: Option<String>,
    pub step: Option<i32>,
    pub default: Option<Value>,
    pub r#type: Option<ParameterType>,
    pub stream_identifier: Option<i32>,
    pub stream_descriptor: Option<StreamDescription>,
    pub children: Children,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixConnection {
    pub sources: Vec<i32>,
    pub operation: Option<ConnectionOperation>,
    pub disposition: Option<ConnectionDisposition>,
}

impl MatrixConnection {
    pub fn is_locked(&self) -> bool {
        matches!(self.disposition, Some(ConnectionDisposition::Locked))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatrixData {
    pub number: i32,
    pub identifier: Option<String>,
    pub description: Option<String>,
    pub r#type: Option<MatrixType>,
    pub addressing_mode: Option<MatrixAddressingMode>,
    pub target_count: i32,
    pub source_count: i32,
    pub maximum_total_connects: Option<i32>,
    pub maximum_connects_per_target: Option<i32>,
    pub parameters_location: Option<ParametersLocation>,
    pub labels: Vec<Label>,
    pub connections: BTreeMap<i32, MatrixConnection>,
    pub children: Children,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionData {
    pub number: i32,
    pub identifier: Option<String>,
    pub description: Option<String>,
    pub arguments: Vec<TupleItemDescription>,
    pub result: Vec<TupleItemDescription>,
    pub children: Children,
}

/// A node in the local mirror. Commands and templates never persist here —
/// commands are transient requests, templates are not addressed by path.
#[derive(Debug, Clone)]
pub enum Element {
    Node(NodeData),
    Parameter(ParameterData),
    Matrix(MatrixData),
    Function(FunctionData),
}

impl Element {
    pub fn number(&self) -> i32 {
        match self {
            Element::Node(n) => n.number,
            Element::Parameter(p) => p.number,
            Element::Matrix(m) => m.number,
            Element::Function(f) => f.number,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        match self {
            Element::Node(n) => n.identifier.as_deref(),
            Element::Parameter(p) => p.identifier.as_deref(),
            Element::Matrix(m) => m.identifier.as_deref(),
            Element::Function(f) => f.identifier.as_deref(),
        }
    }

    pub fn children(&self) -> &Children {
        match self {
            Element::Node(n) => &n.children,
            Element::Parameter(p) => &p.children,
            Element::Matrix(m) => &m.children,
            Element::Function(f) => &f.children,
        }
    }

    pub fn children_mut(&mut self) -> &mut Children {
        match self {
            Element::Node(n) => &mut n.children,
            Element::Parameter(p) => &mut p.children,
            Element::Matrix(m) => &mut m.children,
            Element::Function(f) => &mut f.children,
        }
    }

    pub fn as_parameter(&self) -> Option<&ParameterData> {
        match self {
            Element::Parameter(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&MatrixData> {
        match self {
            Element::Matrix(m) => Some(m),
            _ => None,
        }
    }

    fn merge_node_contents(data: &mut NodeData, contents: &NodeContents) {
        if let Some(v) = &contents.identifier {
            data.identifier = Some(v.clone());
        }
        if let Some(v) = &contents.description {
            data.description = Some(v.clone());
        }
        if contents.is_online.is_some() {
            data.is_online = contents.is_online;
        }
        if let Some(v) = &contents.schema_identifiers {
            data.schema_identifiers = Some(v.clone());
        }
    }

    fn merge_parameter_contents(data: &mut ParameterData, contents: &ParameterContents) -> bool {
        let mut value_changed = false;
        if let Some(v) = &contents.identifier {
            data.identifier = Some(v.clone());
        }
        if let Some(v) = &contents.description {
            data.description = Some(v.clone());
        }
        if let Some(v) = &contents.value {
            data.value = Some(v.clone());
            value_changed = true;
        }
        if let Some(v) = &contents.minimum {
            data.minimum = Some(v.clone());
        }
        if let Some(v) = &contents.maximum {
            data.maximum = Some(v.clone());
        }
        if contents.access.is_some() {
            data.access = contents.access;
        }
        if let Some(v) = &contents.format {
            data.format = Some(v.clone());
        }
        if let Some(v) = &contents.enumeration {
            data.enumeration = Some(v.clone());
        }
        if contents.factor.is_some() {
            data.factor = contents.factor;
        }
        if contents.is_online.is_some() {
            data.is_online = contents.is_online;
        }
        if let Some(v) = &contents.formula {
            data.formula = Some(v.clone());
        }
        if contents.step.is_some() {
            data.step = contents.step;
        }
        if let Some(v) = &contents.default {
            data.default = Some(v.clone());
        }
        if contents.r#type.is_some() {
            data.r#type = contents.r#type;
        }
        if contents.stream_identifier.is_some() {
            data.stream_identifier = contents.stream_identifier;
        }
        if let Some(v) = &contents.stream_descriptor {
            data.stream_descriptor = Some(v.clone());
        }
        value_changed
    }

    fn merge_matrix_contents(data: &mut MatrixData, contents: &MatrixContents) {
        data.identifier = Some(contents.identifier.clone());
        if let Some(v) = &contents.description {
            data.description = Some(v.clone());
        }
        if contents.r#type.is_some() {
            data.r#type = contents.r#type;
        }
        if contents.addressing_mode.is_some() {
            data.addressing_mode = contents.addressing_mode;
        }
        data.target_count = contents.target_count;
        data.source_count = contents.source_count;
        if contents.maximum_total_connects.is_some() {
            data.maximum_total_connects = contents.maximum_total_connects;
        }
        if contents.maximum_connects_per_target.is_some() {
            data.maximum_connects_per_target = contents.maximum_connects_per_target;
        }
        if let Some(v) = &contents.parameters_location {
            data.parameters_location = Some(v.clone());
        }
        if let Some(labels) = &contents.labels {
            data.labels = labels.0.clone();
        }
    }

    fn merge_function_contents(data: &mut FunctionData, contents: &FunctionContents) {
        if let Some(v) = &contents.identifier {
            data.identifier = Some(v.clone());
        }
        if let Some(v) = &contents.description {
            data.description = Some(v.clone());
        }
        if let Some(v) = &contents.arguments {
            data.arguments = v.0.clone();
        }
        if let Some(v) = &contents.result {
            data.result = v.0.clone();
        }
    }

    fn merge_connections(data: &mut MatrixData, connections: &ConnectionCollection) {
        for Connection {
            target,
            sources,
            operation,
            disposition,
        } in &connections.0
        {
            let entry = data.connections.entry(*target).or_default();
            if let Some(PackedNumbers(id)) = sources {
                entry.sources = oid_to_path(id);
            }
            if operation.is_some() {
                entry.operation = *operation;
            }
            if disposition.is_some() {
                entry.disposition = *disposition;
            }
        }
    }
}

/// The local mirror of a peer's Ember+ tree. Root is a sentinel: its children
/// are the top-level nodes, reachable by number but never themselves numbered.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    root: Children,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &Children {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Children {
        &mut self.root
    }

    pub fn add_child(&mut self, element: Element) -> EmberResult<()> {
        self.root.add(element)
    }

    pub fn get_element_by_number(&self, number: i32) -> Option<&Element> {
        self.root.get(number)
    }

    pub fn get_element_by_path(&self, path: &[i32]) -> Option<&Element> {
        let (&first, rest) = path.split_first()?;
        let mut current = self.root.get(first)?;
        for &n in rest {
            current = current.children().get(n)?;
        }
        Some(current)
    }

    pub fn get_element_by_path_mut(&mut self, path: &[i32]) -> Option<&mut Element> {
        let (&first, rest) = path.split_first()?;
        let mut current = self.root.get_mut(first)?;
        for &n in rest {
            current = current.children_mut().get_mut(n)?;
        }
        Some(current)
    }

    /// Walks (creating as plain, content-less nodes where missing) the
    /// ancestor chain down to the parent of `path`'s last segment, so a
    /// qualified fragment lands at the same storage location a positional
    /// traversal would reach.
    fn ensure_parent(&mut self, ancestors: &[i32]) -> &mut Children {
        let mut current = &mut self.root;
        for &number in ancestors {
            current = current
                .entry_or_insert(number, || {
                    Element::Node(NodeData {
                        number,
                        ..Default::default()
                    })
                })
                .children_mut();
        }
        current
    }

    /// Merges a decoded response root into the local mirror, returning the
    /// paths of every parameter whose value changed.
    pub fn merge_root(&mut self, root: &Root) -> Vec<Vec<i32>> {
        match root {
            Root::Elements(RootElementCollection(elements)) => {
                let mut changed = Vec::new();
                for element in elements {
                    self.merge_root_element(element, &mut changed);
                }
                changed
            }
            Root::Streams(StreamCollection(entries)) => {
                let mut changed = Vec::new();
                for entry in entries {
                    if let Some(path) = self.apply_stream_entry(entry.stream_identifier, &entry.stream_value)
                    {
                        changed.push(path);
                    }
                }
                changed
            }
            Root::InvocationResult(_) => Vec::new(),
        }
    }

    fn apply_stream_entry(&mut self, stream_identifier: i32, value: &Value) -> Option<Vec<i32>> {
        fn find(children: &mut Children, stream_identifier: i32, path: &mut Vec<i32>) -> Option<()> {
            for element in children.order.iter_mut() {
                if let Element::Parameter(p) = element {
                    if p.stream_identifier == Some(stream_identifier) {
                        path.push(p.number);
                        return Some(());
                    }
                }
                path.push(element.number());
                if find(element.children_mut(), stream_identifier, path).is_some() {
                    return Some(());
                }
                path.pop();
            }
            None
        }

        let mut path = Vec::new();
        find(&mut self.root, stream_identifier, &mut path)?;
        if let Some(element) = self.get_element_by_path_mut(&path) {
            if let Element::Parameter(p) = element {
                p.value = Some(value.clone());
            }
        }
        Some(path)
    }

    fn merge_root_element(&mut self, element: &RootElement, changed: &mut Vec<Vec<i32>>) {
        match element {
            RootElement::Element(e) => {
                Self::merge_positional(&mut self.root, &[], e, changed);
            }
            RootElement::QualifiedNode(QualifiedNode {
                path,
                contents,
                children,
            }) => {
                let full = oid_to_path(path);
                let (ancestors, number) = split_path(&full);
                let parent = self.ensure_parent(ancestors);
                let node = parent.entry_or_insert(number, || {
                    Element::Node(NodeData {
                        number,
                        ..Default::default()
                    })
                });
                if let (Element::Node(data), Some(contents)) = (&mut *node, contents) {
                    Element::merge_node_contents(data, contents);
                }
                if let Some(children) = children {
                    for child in &children.0 {
                        Self::merge_positional(node.children_mut(), &full, child, changed);
                    }
                }
            }
            RootElement::QualifiedParameter(QualifiedParameter {
                path,
                contents,
                children,
            }) => {
                let full = oid_to_path(path);
                let (ancestors, number) = split_path(&full);
                let parent = self.ensure_parent(ancestors);
                let node = parent.entry_or_insert(number, || {
                    Element::Parameter(ParameterData {
                        number,
                        ..Default::default()
                    })
                });
                if let Element::Parameter(data) = node {
                    if let Some(contents) = contents {
                        if Element::merge_parameter_contents(data, contents) {
                            changed.push(full.clone());
                        }
                    }
                }
                if let Some(children) = children {
                    for child in &children.0 {
                        Self::merge_positional(node.children_mut(), &full, child, changed);
                    }
                }
            }
            RootElement::QualifiedMatrix(QualifiedMatrix {
                path,
                contents,
                children,
                connections,
                ..
            }) => {
                let full = oid_to_path(path);
                let (ancestors, number) = split_path(&full);
                let parent = self.ensure_parent(ancestors);
                let node = parent.entry_or_insert(number, || {
                    Element::Matrix(MatrixData {
                        number,
                        ..Default::default()
                    })
                });
                if let Element::Matrix(data) = node {
                    if let Some(contents) = contents {
                        Element::merge_matrix_contents(data, contents);
                    }
                    if let Some(connections) = connections {
                        Element::merge_connections(data, connections);
                    }
                }
                if let Some(children) = children {
                    for child in &children.0 {
                        Self::merge_positional(node.children_mut(), &full, child, changed);
                    }
                }
            }
            RootElement::QualifiedFunction(QualifiedFunction {
                path,
                contents,
                children,
            }) => {
                let full = oid_to_path(path);
                let (ancestors, number) = split_path(&full);
                let parent = self.ensure_parent(ancestors);
                let node = parent.entry_or_insert(number, || {
                    Element::Function(FunctionData {
                        number,
                        ..Default::default()
                    })
                });
                if let Element::Function(data) = node {
                    if let Some(contents) = contents {
                        Element::merge_function_contents(data, contents);
                    }
                }
                if let Some(children) = children {
                    for child in &children.0 {
                        Self::merge_positional(node.children_mut(), &full, child, changed);
                    }
                }
            }
            RootElement::QualifiedTemplate(QualifiedTemplate { .. }) => {
                // templates are not addressed by path and are not part of the
                // persisted tree.
            }
        }
    }

    fn merge_positional(
        children: &mut Children,
        parent_path: &[i32],
        element: &GlowElement,
        changed: &mut Vec<Vec<i32>>,
    ) {
        match element {
            GlowElement::Node(n) => {
                let number = n.number;
                let mut path = parent_path.to_vec();
                path.push(number);
                let node = children.entry_or_insert(number, || {
                    Element::Node(NodeData {
                        number,
                        ..Default::default()
                    })
                });
                if let (Element::Node(data), Some(contents)) = (&mut *node, &n.contents) {
                    Element::merge_node_contents(data, contents);
                }
                if let Some(kids) = &n.children {
                    for child in &kids.0 {
                        Self::merge_positional(node.children_mut(), &path, child, changed);
                    }
                }
            }
            GlowElement::Parameter(p) => {
                let number = p.number;
                let mut path = parent_path.to_vec();
                path.push(number);
                let node = children.entry_or_insert(number, || {
                    Element::Parameter(ParameterData {
                        number,
                        ..Default::default()
                    })
                });
                if let Element::Parameter(data) = node {
                    if let Some(contents) = &p.contents {
                        if Element::merge_parameter_contents(data, contents) {
                            changed.push(path.clone());
                        }
                    }
                }
                if let Some(kids) = &p.children {
                    for child in &kids.0 {
                        Self::merge_positional(node.children_mut(), &path, child, changed);
                    }
                }
            }
            GlowElement::Matrix(m) => {
                let number = m.number;
                let mut path = parent_path.to_vec();
                path.push(number);
                let node = children.entry_or_insert(number, || {
                    Element::Matrix(MatrixData {
                        number,
                        ..Default::default()
                    })
                });
                if let Element::Matrix(data) = node {
                    if let Some(contents) = &m.contents {
                        Element::merge_matrix_contents(data, contents);
                    }
                    if let Some(connections) = &m.connections {
                        Element::merge_connections(data, connections);
                    }
                }
                if let Some(kids) = &m.children {
                    for child in &kids.0 {
                        Self::merge_positional(node.children_mut(), &path, child, changed);
                    }
                }
            }
            GlowElement::Function(f) => {
                let number = f.number;
                let mut path = parent_path.to_vec();
                path.push(number);
                let node = children.entry_or_insert(number, || {
                    Element::Function(FunctionData {
                        number,
                        ..Default::default()
                    })
                });
                if let Element::Function(data) = node {
                    if let Some(contents) = &f.contents {
                        Element::merge_function_contents(data, contents);
                    }
                }
                if let Some(kids) = &f.children {
                    for child in &kids.0 {
                        Self::merge_positional(node.children_mut(), &path, child, changed);
                    }
                }
            }
            GlowElement::Command(_) | GlowElement::Template(_) => {
                // commands are transient, templates aren't persisted tree nodes.
            }
        }
    }

    // ---- request builders -------------------------------------------------

    pub fn get_directory_request(path: &[i32], flags: Option<FieldFlags>) -> Root {
        qualified_command(path, Command::get_directory(flags))
    }

    pub fn subscribe_request(path: &[i32]) -> Root {
        qualified_command(
            path,
            Command {
                number: crate::glow::CommandType::Subscribe,
                options: None,
            },
        )
    }

    pub fn unsubscribe_request(path: &[i32]) -> Root {
        qualified_command(
            path,
            Command {
                number: crate::glow::CommandType::Unsubscribe,
                options: None,
            },
        )
    }

    pub fn set_value_request(path: &[i32], value: Value) -> Root {
        let fragment = QualifiedParameter {
            path: oid(path),
            contents: Some(ParameterContents {
                identifier: None,
                description: None,
                value: Some(value),
                minimum: None,
                maximum: None,
                access: None,
                format: None,
                enumeration: None,
                factor: None,
                is_online: None,
                formula: None,
                step: None,
                default: None,
                r#type: None,
                stream_identifier: None,
                enum_map: None,
                stream_descriptor: None,
                schema_identifiers: None,
                template_reference: None,
            }),
            children: None,
        };
        Root::Elements(RootElementCollection(vec![RootElement::QualifiedParameter(
            fragment,
        )]))
    }

    pub fn invoke_request(path: &[i32], invocation_id: i32, args: Vec<Value>) -> Root {
        let cmd = Command {
            number: crate::glow::CommandType::Invoke,
            options: Some(CommandOptions::Invocation(Invocation {
                invocation_id: Some(invocation_id),
                arguments: Some(Tuple(args)),
            })),
        };
        qualified_command(path, cmd)
    }

    pub fn connect_request(
        path: &[i32],
        target: i32,
        sources: &[i32],
        operation: ConnectionOperation,
    ) -> Root {
        let fragment = QualifiedMatrix {
            path: oid(path),
            contents: None,
            children: None,
            targets: None,
            sources: None,
            connections: Some(ConnectionCollection(vec![Connection {
                target,
                sources: Some(PackedNumbers(oid(sources))),
                operation: Some(operation),
                disposition: None,
            }])),
        };
        Root::Elements(RootElementCollection(vec![RootElement::QualifiedMatrix(
            fragment,
        )]))
    }

    /// Re-encodes the whole mirror as a single positional root, suitable for
    /// a BER-encoded snapshot of the session.
    pub fn to_root(&self) -> Root {
        Root::Elements(RootElementCollection(Self::to_glow_elements(&self.root)))
    }

    fn to_glow_elements(children: &Children) -> Vec<RootElement> {
        children
            .iter()
            .map(|element| RootElement::Element(Self::to_glow_element(element)))
            .collect()
    }

    fn to_glow_element(element: &Element) -> GlowElement {
        match element {
            Element::Node(n) => GlowElement::Node(crate::glow::Node {
                number: n.number,
                contents: Some(NodeContents {
                    identifier: n.identifier.clone(),
                    description: n.description.clone(),
                    is_root: None,
                    is_online: n.is_online,
                    schema_identifiers: n.schema_identifiers.clone(),
                    template_reference: None,
                }),
                children: child_collection(&n.children),
            }),
            Element::Parameter(p) => GlowElement::Parameter(crate::glow::Parameter {
                number: p.number,
                contents: Some(ParameterContents {
                    identifier: p.identifier.clone(),
                    description: p.description.clone(),
                    value: p.value.clone(),
                    minimum: p.minimum.clone(),
                    maximum: p.maximum.clone(),
                    access: p.access,
                    format: p.format.clone(),
                    enumeration: p.enumeration.clone(),
                    factor: p.factor,
                    is_online: p.is_online,
                    formula: p.formula.clone(),
                    step: p.step,
                    default: p.default.clone(),
                    r#type: p.r#type,
                    stream_identifier: p.stream_identifier,
                    enum_map: None,
                    stream_descriptor: p.stream_descriptor.clone(),
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children: child_collection(&p.children),
            }),
            Element::Matrix(m) => GlowElement::Matrix(crate::glow::Matrix {
                number: m.number,
                contents: Some(MatrixContents {
                    identifier: m.identifier.clone().unwrap_or_default(),
                    description: m.description.clone(),
                    r#type: m.r#type,
                    addressing_mode: m.addressing_mode,
                    target_count: m.target_count,
                    source_count: m.source_count,
                    maximum_total_connects: m.maximum_total_connects,
                    maximum_connects_per_target: m.maximum_connects_per_target,
                    parameters_location: m.parameters_location.clone(),
                    gain_parameter_number: None,
                    labels: if m.labels.is_empty() {
                        None
                    } else {
                        Some(crate::glow::LabelCollection(m.labels.clone()))
                    },
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children: child_collection(&m.children),
                targets: None,
                sources: None,
                connections: if m.connections.is_empty() {
                    None
                } else {
                    Some(ConnectionCollection(
                        m.connections
                            .iter()
                            .map(|(&target, c)| Connection {
                                target,
                                sources: Some(PackedNumbers(oid(&c.sources))),
                                operation: c.operation,
                                disposition: c.disposition,
                            })
                            .collect(),
                    ))
                },
            }),
            Element::Function(f) => GlowElement::Function(crate::glow::Function {
                number: f.number,
                contents: Some(FunctionContents {
                    identifier: f.identifier.clone(),
                    description: f.description.clone(),
                    arguments: if f.arguments.is_empty() {
                        None
                    } else {
                        Some(TupleDescription(f.arguments.clone()))
                    },
                    result: if f.result.is_empty() {
                        None
                    } else {
                        Some(TupleDescription(f.result.clone()))
                    },
                    template_reference: None,
                }),
                children: child_collection(&f.children),
            }),
        }
    }
}

fn split_path(path: &[i32]) -> (&[i32], i32) {
    let (&last, rest) = path.split_last().expect("qualified path is never empty");
    (rest, last)
}

fn child_collection(children: &Children) -> Option<crate::glow::ElementCollection> {
    if children.is_empty() {
        None
    } else {
        Some(crate::glow::ElementCollection(
            children.iter().map(Tree::to_glow_element).collect(),
        ))
    }
}

fn qualified_command(path: &[i32], cmd: Command) -> Root {
    if path.is_empty() {
        return Root::from(cmd);
    }
    let fragment = QualifiedNode {
        path: oid(path),
        contents: None,
        children: Some(crate::glow::ElementCollection(vec![GlowElement::Command(
            cmd,
        )])),
    };
    Root::Elements(RootElementCollection(vec![RootElement::QualifiedNode(
        fragment,
    )]))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::glow::{self, CommandType, ElementCollection};

    fn node(number: i32) -> Element {
        Element::Node(NodeData {
            number,
            identifier: Some(format!("node{number}")),
            ..Default::default()
        })
    }

    #[test]
    fn add_child_rejects_duplicate_number() {
        let mut tree = Tree::new();
        tree.add_child(node(1)).unwrap();
        let err = tree.add_child(node(1)).unwrap_err();
        assert!(matches!(err, EmberError::DuplicateNumber(1)));
    }

    #[test]
    fn get_element_by_path_walks_nested_children() {
        let mut tree = Tree::new();
        tree.add_child(node(1)).unwrap();
        if let Element::Node(data) = tree.get_element_by_path_mut(&[1]).unwrap() {
            data.children
                .add(Element::Parameter(ParameterData {
                    number: 2,
                    identifier: Some("gain".into()),
                    ..Default::default()
                }))
                .unwrap();
        }
        let found = tree.get_element_by_path(&[1, 2]).unwrap();
        assert_eq!(found.identifier(), Some("gain"));
        assert!(tree.get_element_by_path(&[1, 9]).is_none());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut tree = Tree::new();
        let root = Root::Elements(RootElementCollection(vec![RootElement::Element(
            glow::Element::Parameter(glow::Parameter {
                number: 1,
                contents: Some(ParameterContents {
                    identifier: Some("level".into()),
                    description: None,
                    value: Some(Value::Integer(5)),
                    minimum: None,
                    maximum: None,
                    access: None,
                    format: None,
                    enumeration: None,
                    factor: None,
                    is_online: None,
                    formula: None,
                    step: None,
                    default: None,
                    r#type: None,
                    stream_identifier: None,
                    enum_map: None,
                    stream_descriptor: None,
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children: None,
            }),
        )]));
        let first = tree.merge_root(&root);
        let second = tree.merge_root(&root);
        assert_eq!(first, vec![vec![1]]);
        assert_eq!(second, vec![vec![1]]);
        let param = tree.get_element_by_path(&[1]).unwrap().as_parameter().unwrap();
        assert_eq!(param.value, Some(Value::Integer(5)));
    }

    #[test]
    fn qualified_fragment_lands_at_positional_path() {
        let mut tree = Tree::new();
        tree.add_child(node(1)).unwrap();
        let qualified = Root::Elements(RootElementCollection(vec![
            RootElement::QualifiedParameter(QualifiedParameter {
                path: oid(&[1, 2]),
                contents: Some(ParameterContents {
                    identifier: Some("gain".into()),
                    description: None,
                    value: Some(Value::Integer(7)),
                    minimum: None,
                    maximum: None,
                    access: None,
                    format: None,
                    enumeration: None,
                    factor: None,
                    is_online: None,
                    formula: None,
                    step: None,
                    default: None,
                    r#type: None,
                    stream_identifier: None,
                    enum_map: None,
                    stream_descriptor: None,
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children: None,
            }),
        ]));
        tree.merge_root(&qualified);
        let found = tree.get_element_by_path(&[1, 2]).unwrap();
        assert_eq!(found.identifier(), Some("gain"));
    }

    #[test]
    fn matrix_connect_merges_into_connections_map() {
        let mut tree = Tree::new();
        tree.add_child(Element::Matrix(MatrixData {
            number: 1,
            identifier: Some("router".into()),
            target_count: 4,
            source_count: 4,
            ..Default::default()
        }))
        .unwrap();
        let root = Root::Elements(RootElementCollection(vec![RootElement::QualifiedMatrix(
            QualifiedMatrix {
                path: oid(&[1]),
                contents: None,
                children: None,
                targets: None,
                sources: None,
                connections: Some(ConnectionCollection(vec![Connection {
                    target: 3,
                    sources: Some(PackedNumbers(oid(&[1, 2]))),
                    operation: Some(ConnectionOperation::Connect),
                    disposition: None,
                }])),
            },
        )]));
        tree.merge_root(&root);
        let matrix = tree.get_element_by_path(&[1]).unwrap().as_matrix().unwrap();
        let connection = &matrix.connections[&3];
        assert_eq!(connection.sources, vec![1, 2]);
        assert_eq!(connection.operation, Some(ConnectionOperation::Connect));
        assert!(!connection.is_locked());
    }

    #[test]
    fn get_directory_request_root_level_uses_bare_command() {
        let root = Tree::get_directory_request(&[], None);
        match root {
            Root::Elements(RootElementCollection(elements)) => {
                assert_eq!(elements.len(), 1);
                assert!(matches!(
                    &elements[0],
                    RootElement::Element(glow::Element::Command(glow::Command {
                        number: CommandType::GetDirectory,
                        ..
                    }))
                ));
            }
            _ => panic!("expected an Elements root"),
        }
    }

    #[test]
    fn get_directory_request_for_path_wraps_in_qualified_node() {
        let root = Tree::get_directory_request(&[1, 2], None);
        match root {
            Root::Elements(RootElementCollection(elements)) => {
                match &elements[0] {
                    RootElement::QualifiedNode(QualifiedNode { path, children, .. }) => {
                        assert_eq!(oid_to_path(path), vec![1, 2]);
                        let ElementCollection(kids) = children.as_ref().unwrap();
                        assert_eq!(kids.len(), 1);
                    }
                    _ => panic!("expected a qualified node"),
                }
            }
            _ => panic!("expected an Elements root"),
        }
    }

    #[test]
    fn to_root_roundtrips_through_encoding() {
        let mut tree = Tree::new();
        tree.add_child(node(1)).unwrap();
        let encoded = rasn::ber::encode(&tree.to_root()).unwrap();
        let decoded: Root = rasn::ber::decode(&encoded).unwrap();
        let mut rebuilt = Tree::new();
        rebuilt.merge_root(&decoded);
        let found = rebuilt.get_element_by_path(&[1]).unwrap();
        assert_eq!(found.identifier(), Some("node1"));
    }
}
