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

//! Serializes outbound client operations onto a single in-flight slot,
//! correlates inbound roots to the waiting request, and merges every inbound
//! root into the shared tree whether or not it was solicited. Function
//! invocations are the one exception to the single-slot rule: they're
//! matched by invocation id in a separate table, so any number of them can
//! be outstanding at once, interleaved with whatever occupies the slot.

use crate::{
    error::{EmberError, EmberResult},
    glow::{
        Element as GlowElement, InvocationResult, Root, RootElement, RootElementCollection, Value,
    },
    tree::{Element, Tree, oid_to_path},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    spawn,
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};
#[cfg(feature = "tracing")]
use tracing::{trace, warn};

/// What a pending request is waiting for in the next inbound root.
#[derive(Debug, Clone)]
pub enum Matcher {
    GetDirectory { target: Vec<i32> },
    SetValue { target: Vec<i32> },
    MatrixOp { target: Vec<i32> },
    Invocation { id: i32 },
    /// subscribe/unsubscribe: resolves as soon as the frame is flushed.
    FireAndForget,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
    ValueChange { path: Vec<i32>, value: Value },
    InvocationResult {
        invocation_id: i32,
        success: Option<bool>,
        result: Option<Vec<Value>>,
    },
}

struct Request {
    root: Root,
    matcher: Matcher,
    deadline: Duration,
    reply: oneshot::Sender<EmberResult<Root>>,
}

struct ActiveRequest {
    deadline: Instant,
    matcher: Matcher,
    reply: oneshot::Sender<EmberResult<Root>>,
}

enum PipelineCommand {
    Enqueue(Request),
    Disconnect,
}

/// Handle to the single-active-request actor. Cloning shares the same queue
/// and tree; the actor task itself is the only writer of the tree.
#[derive(Clone)]
pub struct Pipeline {
    commands: mpsc::Sender<PipelineCommand>,
    tree: Arc<Mutex<Tree>>,
}

impl Pipeline {
    pub fn spawn(
        outbound: mpsc::Sender<Root>,
        inbound: mpsc::Receiver<Root>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let tree = Arc::new(Mutex::new(Tree::new()));
        let (commands_tx, commands_rx) = mpsc::channel(64);
        spawn(run(commands_rx, outbound, inbound, tree.clone(), events));
        Self {
            commands: commands_tx,
            tree,
        }
    }

    pub fn tree(&self) -> &Arc<Mutex<Tree>> {
        &self.tree
    }

    pub async fn submit(&self, root: Root, matcher: Matcher, deadline: Duration) -> EmberResult<Root> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::Enqueue(Request {
                root,
                matcher,
                deadline,
                reply,
            }))
            .await
            .map_err(|_| EmberError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| EmberError::ConnectionClosed)?
    }

    pub async fn disconnect(&self) {
        let _ = self.commands.send(PipelineCommand::Disconnect).await;
    }
}

async fn run(
    mut commands: mpsc::Receiver<PipelineCommand>,
    outbound: mpsc::Sender<Root>,
    mut inbound: mpsc::Receiver<Root>,
    tree: Arc<Mutex<Tree>>,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut queue: VecDeque<Request> = VecDeque::new();
    let mut active: Option<ActiveRequest> = None;
    let mut invocations: HashMap<i32, ActiveRequest> = HashMap::new();

    loop {
        // Invocations never wait on the single non-invocation slot, and
        // don't serialize against each other either: flush every queued one
        // as soon as it's reached, wherever it sits in the queue.
        let mut i = 0;
        while i < queue.len() {
            if matches!(queue[i].matcher, Matcher::Invocation { .. }) {
                let Request {
                    root,
                    matcher,
                    deadline,
                    reply,
                } = queue.remove(i).unwrap();
                let Matcher::Invocation { id } = matcher else {
                    unreachable!()
                };
                if outbound.send(root).await.is_err() {
                    #[cfg(feature = "tracing")]
                    warn!("Transport closed while flushing a pipelined invocation.");
                    let _ = reply.send(Err(EmberError::ConnectionClosed));
                    if let Some(a) = active.take() {
                        let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    for req in queue.drain(..) {
                        let _ = req.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    for (_, a) in invocations.drain() {
                        let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    return;
                }
                invocations.insert(
                    id,
                    ActiveRequest {
                        deadline: Instant::now() + deadline,
                        matcher: Matcher::Invocation { id },
                        reply,
                    },
                );
            } else {
                i += 1;
            }
        }

        if active.is_none() {
            if let Some(req) = queue.pop_front() {
                let Request {
                    root,
                    matcher,
                    deadline,
                    reply,
                } = req;
                if outbound.send(root).await.is_err() {
                    #[cfg(feature = "tracing")]
                    warn!("Transport closed while flushing a pipelined request.");
                    let _ = reply.send(Err(EmberError::ConnectionClosed));
                    for req in queue.drain(..) {
                        let _ = req.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    for (_, a) in invocations.drain() {
                        let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    return;
                } else if matches!(matcher, Matcher::FireAndForget) {
                    let _ = reply.send(Ok(Root::Elements(RootElementCollection(Vec::new()))));
                } else {
                    active = Some(ActiveRequest {
                        deadline: Instant::now() + deadline,
                        matcher,
                        reply,
                    });
                }
            }
        }

        let next_deadline = active
            .as_ref()
            .map(|a| a.deadline)
            .into_iter()
            .chain(invocations.values().map(|a| a.deadline))
            .min();

        let deadline_fut = async {
            match next_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = deadline_fut, if next_deadline.is_some() => {
                let now = Instant::now();
                if matches!(&active, Some(a) if a.deadline <= now) {
                    if let Some(a) = active.take() {
                        let _ = a.reply.send(Err(EmberError::Timeout));
                    }
                }
                let expired: Vec<i32> = invocations
                    .iter()
                    .filter(|(_, a)| a.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(a) = invocations.remove(&id) {
                        let _ = a.reply.send(Err(EmberError::Timeout));
                    }
                }
            }

            root = inbound.recv() => {
                let Some(root) = root else {
                    if let Some(a) = active.take() {
                        let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    for (_, a) in invocations.drain() {
                        let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                    }
                    let _ = events.send(SessionEvent::Disconnected);
                    return;
                };
                handle_inbound(root, &tree, &mut active, &mut invocations, &events);
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(PipelineCommand::Enqueue(req)) => queue.push_back(req),
                    Some(PipelineCommand::Disconnect) | None => {
                        if let Some(a) = active.take() {
                            let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                        }
                        for req in queue.drain(..) {
                            let _ = req.reply.send(Err(EmberError::ConnectionClosed));
                        }
                        for (_, a) in invocations.drain() {
                            let _ = a.reply.send(Err(EmberError::ConnectionClosed));
                        }
                        return;
                    }
                }
            }
        }
    }
}

fn handle_inbound(
    root: Root,
    tree: &Arc<Mutex<Tree>>,
    active: &mut Option<ActiveRequest>,
    invocations: &mut HashMap<i32, ActiveRequest>,
    events: &broadcast::Sender<SessionEvent>,
) {
    #[cfg(feature = "tracing")]
    trace!("Merging inbound root into tree: {root:?}");

    let changed = tree.lock().unwrap().merge_root(&root);
    for path in changed {
        let value = tree
            .lock()
            .unwrap()
            .get_element_by_path(&path)
            .and_then(Element::as_parameter)
            .and_then(|p| p.value.clone());
        if let Some(value) = value {
            let _ = events.send(SessionEvent::ValueChange { path, value });
        }
    }

    if let Root::InvocationResult(InvocationResult {
        invocation_id,
        success,
        result,
    }) = &root
    {
        let invocation_id = *invocation_id;
        let success = *success;
        let result = result.as_ref().map(|t| t.0.clone());
        if let Some(a) = invocations.remove(&invocation_id) {
            let _ = a.reply.send(Ok(root));
        } else {
            let _ = events.send(SessionEvent::InvocationResult {
                invocation_id,
                success,
                result,
            });
        }
        return;
    }

    let is_match = matches!(active.as_ref(), Some(a) if matcher_matches(&a.matcher, &root));
    if is_match {
        if let Some(a) = active.take() {
            let _ = a.reply.send(Ok(root));
        }
    }
}

fn matcher_matches(matcher: &Matcher, root: &Root) -> bool {
    match matcher {
        Matcher::GetDirectory { target } if target.is_empty() => match root {
            Root::Elements(RootElementCollection(elements)) => !elements.is_empty(),
            _ => false,
        },
        Matcher::GetDirectory { target } => locate(root, target)
            .map(|l| l.has_children || l.is_matrix)
            .unwrap_or(false),
        Matcher::SetValue { target } => locate(root, target).map(|l| l.has_value).unwrap_or(false),
        Matcher::MatrixOp { target } => locate(root, target)
            .map(|l| l.is_matrix && l.has_connections)
            .unwrap_or(false),
        // Invocations never occupy `active` — they're matched by id against
        // the `invocations` table instead, before this function is reached.
        Matcher::Invocation { .. } => false,
        Matcher::FireAndForget => true,
    }
}

struct Located {
    has_children: bool,
    is_matrix: bool,
    has_value: bool,
    has_connections: bool,
}

fn locate(root: &Root, target: &[i32]) -> Option<Located> {
    match root {
        Root::Elements(RootElementCollection(elements)) => {
            elements.iter().find_map(|e| locate_root_element(e, target))
        }
        _ => None,
    }
}

fn locate_root_element(element: &RootElement, target: &[i32]) -> Option<Located> {
    use crate::glow::{QualifiedFunction, QualifiedMatrix, QualifiedNode, QualifiedParameter};

    match element {
        RootElement::Element(e) => locate_positional(e, &[], target),
        RootElement::QualifiedNode(QualifiedNode { path, children, .. }) => {
            (oid_to_path(path) == target).then(|| Located {
                has_children: children.is_some(),
                is_matrix: false,
                has_value: false,
                has_connections: false,
            })
        }
        RootElement::QualifiedParameter(QualifiedParameter { path, contents, .. }) => {
            (oid_to_path(path) == target).then(|| Located {
                has_children: false,
                is_matrix: false,
                has_value: contents.as_ref().is_some_and(|c| c.value.is_some()),
                has_connections: false,
            })
        }
        RootElement::QualifiedMatrix(QualifiedMatrix {
            path,
            children,
            connections,
            ..
        }) => (oid_to_path(path) == target).then(|| Located {
            has_children: children.is_some(),
            is_matrix: true,
            has_value: false,
            has_connections: connections.is_some(),
        }),
        RootElement::QualifiedFunction(QualifiedFunction { path, children, .. }) => {
            (oid_to_path(path) == target).then(|| Located {
                has_children: children.is_some(),
                is_matrix: false,
                has_value: false,
                has_connections: false,
            })
        }
        RootElement::QualifiedTemplate(_) => None,
    }
}

fn locate_positional(element: &GlowElement, parent_path: &[i32], target: &[i32]) -> Option<Located> {
    match element {
        GlowElement::Node(n) => {
            let mut path = parent_path.to_vec();
            path.push(n.number);
            if path == target {
                return Some(Located {
                    has_children: n.children.is_some(),
                    is_matrix: false,
                    has_value: false,
                    has_connections: false,
                });
            }
            n.children
                .as_ref()
                .and_then(|c| c.0.iter().find_map(|child| locate_positional(child, &path, target)))
        }
        GlowElement::Parameter(p) => {
            let mut path = parent_path.to_vec();
            path.push(p.number);
            if path == target {
                return Some(Located {
                    has_children: false,
                    is_matrix: false,
                    has_value: p.contents.as_ref().is_some_and(|c| c.value.is_some()),
                    has_connections: false,
                });
            }
            p.children
                .as_ref()
                .and_then(|c| c.0.iter().find_map(|child| locate_positional(child, &path, target)))
        }
        GlowElement::Matrix(m) => {
            let mut path = parent_path.to_vec();
            path.push(m.number);
            if path == target {
                return Some(Located {
                    has_children: m.children.is_some(),
                    is_matrix: true,
                    has_value: false,
                    has_connections: m.connections.is_some(),
                });
            }
            m.children
                .as_ref()
                .and_then(|c| c.0.iter().find_map(|child| locate_positional(child, &path, target)))
        }
        GlowElement::Function(f) => {
            let mut path = parent_path.to_vec();
            path.push(f.number);
            if path == target {
                return Some(Located {
                    has_children: f.children.is_some(),
                    is_matrix: false,
                    has_value: false,
                    has_connections: false,
                });
            }
            f.children
                .as_ref()
                .and_then(|c| c.0.iter().find_map(|child| locate_positional(child, &path, target)))
        }
        GlowElement::Command(_) | GlowElement::Template(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::glow::{
        Command, CommandOptions, CommandType, Invocation, MatrixContents, Parameter,
        ParameterContents, QualifiedParameter, Tuple,
    };
    use tokio::sync::mpsc::channel;

    fn param_root(number: i32, value: i32) -> Root {
        Root::Elements(RootElementCollection(vec![RootElement::Element(
            GlowElement::Parameter(Parameter {
                number,
                contents: Some(ParameterContents {
                    identifier: None,
                    description: None,
                    value: Some(Value::Integer(value as i64)),
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
        )]))
    }

    #[tokio::test]
    async fn get_directory_resolves_when_children_arrive() {
        let (out_tx, mut out_rx) = channel::<Root>(4);
        let (in_tx, in_rx) = channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx);

        let request = Root::Elements(RootElementCollection(vec![RootElement::Element(
            GlowElement::Command(Command {
                number: CommandType::GetDirectory,
                options: None,
            }),
        )]));

        let submit = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .submit(request, Matcher::GetDirectory { target: vec![] }, Duration::from_secs(1))
                    .await
            }
        });

        out_rx.recv().await.unwrap();
        in_tx.send(param_root(1, 5)).await.unwrap();

        let result = submit.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn timed_out_request_does_not_block_the_next_one() {
        let (out_tx, mut out_rx) = channel::<Root>(4);
        let (in_tx, in_rx) = channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx);

        let first = pipeline.submit(
            Root::Elements(RootElementCollection(vec![])),
            Matcher::GetDirectory { target: vec![1] },
            Duration::from_millis(20),
        );
        let err = first.await.unwrap_err();
        assert!(matches!(err, EmberError::Timeout));
        out_rx.recv().await.unwrap();

        let second = pipeline.submit(
            param_root(2, 9),
            Matcher::SetValue { target: vec![2] },
            Duration::from_secs(1),
        );
        let submit = tokio::spawn(second);
        out_rx.recv().await.unwrap();
        in_tx.send(param_root(2, 9)).await.unwrap();
        let result = submit.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invocation_is_matched_by_id_not_path() {
        let (out_tx, mut out_rx) = channel::<Root>(4);
        let (in_tx, in_rx) = channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx);

        let invoke = Root::Elements(RootElementCollection(vec![RootElement::Element(
            GlowElement::Command(Command {
                number: CommandType::Invoke,
                options: Some(CommandOptions::Invocation(Invocation {
                    invocation_id: Some(7),
                    arguments: Some(Tuple(vec![Value::Integer(1)])),
                })),
            }),
        )]));

        let submit = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .submit(invoke, Matcher::Invocation { id: 7 }, Duration::from_secs(1))
                    .await
            }
        });

        out_rx.recv().await.unwrap();
        in_tx
            .send(Root::InvocationResult(InvocationResult {
                invocation_id: 7,
                success: Some(true),
                result: None,
            }))
            .await
            .unwrap();

        let result = submit.await.unwrap();
        assert!(result.is_ok());
    }

    fn invoke_root(invocation_id: i32, arg: i64) -> Root {
        Root::Elements(RootElementCollection(vec![RootElement::Element(
            GlowElement::Command(Command {
                number: CommandType::Invoke,
                options: Some(CommandOptions::Invocation(Invocation {
                    invocation_id: Some(invocation_id),
                    arguments: Some(Tuple(vec![Value::Integer(arg)])),
                })),
            }),
        )]))
    }

    #[tokio::test]
    async fn two_invocations_resolve_even_when_replies_arrive_out_of_order() {
        let (out_tx, mut out_rx) = channel::<Root>(4);
        let (in_tx, in_rx) = channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx);

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .submit(invoke_root(1, 1), Matcher::Invocation { id: 1 }, Duration::from_secs(1))
                    .await
            }
        });
        let second = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .submit(invoke_root(2, 2), Matcher::Invocation { id: 2 }, Duration::from_secs(1))
                    .await
            }
        });

        // Both invocations are flushed without waiting on one another.
        out_rx.recv().await.unwrap();
        out_rx.recv().await.unwrap();

        // Reply to invocation 2 before invocation 1.
        in_tx
            .send(Root::InvocationResult(InvocationResult {
                invocation_id: 2,
                success: Some(true),
                result: None,
            }))
            .await
            .unwrap();
        in_tx
            .send(Root::InvocationResult(InvocationResult {
                invocation_id: 1,
                success: Some(true),
                result: None,
            }))
            .await
            .unwrap();

        assert!(second.await.unwrap().is_ok());
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn invocation_is_not_blocked_by_an_in_flight_non_invocation_request() {
        let (out_tx, mut out_rx) = channel::<Root>(4);
        let (in_tx, in_rx) = channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx);

        // Occupy the single non-invocation slot with a getDirectory that
        // never resolves in this test.
        let blocker = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .submit(
                        Root::Elements(RootElementCollection(vec![])),
                        Matcher::GetDirectory { target: vec![1] },
                        Duration::from_secs(5),
                    )
                    .await
            }
        });
        out_rx.recv().await.unwrap();

        let invoke = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .submit(invoke_root(9, 1), Matcher::Invocation { id: 9 }, Duration::from_secs(1))
                    .await
            }
        });

        // The invocation is flushed despite the still-active getDirectory.
        out_rx.recv().await.unwrap();
        in_tx
            .send(Root::InvocationResult(InvocationResult {
                invocation_id: 9,
                success: Some(true),
                result: None,
            }))
            .await
            .unwrap();
        assert!(invoke.await.unwrap().is_ok());

        drop(blocker);
    }

    #[test]
    fn locate_finds_matrix_connections_at_qualified_path() {
        let root = Root::Elements(RootElementCollection(vec![RootElement::QualifiedMatrix(
            crate::glow::QualifiedMatrix {
                path: crate::tree::oid(&[1]),
                contents: None,
                children: None,
                targets: None,
                sources: None,
                connections: Some(crate::glow::ConnectionCollection(vec![])),
            },
        )]));
        let located = locate(&root, &[1]).unwrap();
        assert!(located.is_matrix);
        assert!(located.has_connections);
    }

    #[test]
    fn locate_misses_unrelated_matrix_contents() {
        let root = Root::Elements(RootElementCollection(vec![RootElement::Element(
            GlowElement::Matrix(crate::glow::Matrix {
                number: 1,
                contents: Some(MatrixContents {
                    identifier: "router".into(),
                    description: None,
                    r#type: None,
                    addressing_mode: None,
                    target_count: 1,
                    source_count: 1,
                    maximum_total_connects: None,
                    maximum_connects_per_target: None,
                    parameters_location: None,
                    gain_parameter_number: None,
                    labels: None,
                    schema_identifiers: None,
                    template_reference: None,
                }),
                children: None,
                targets: None,
                sources: None,
                connections: None,
            }),
        )]));
        assert!(locate(&root, &[2]).is_none());
    }
}
