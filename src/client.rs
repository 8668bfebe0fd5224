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

//! The public facade: one `EmberClient` per peer connection, composing the
//! TCP consumer, the request pipeline and the local tree mirror behind a
//! small set of async operations plus a broadcast event stream. Callers that
//! want unsolicited value changes for a path subscribe on the wire with
//! [`EmberClient::subscribe`] and filter [`SessionEvent::ValueChange`] off
//! [`EmberClient::events`] themselves — there is a single shared stream
//! rather than a per-call callback.

use crate::{
    config::SessionConfig,
    consumer::start_tcp_consumer,
    error::{EmberError, EmberResult},
    glow::{ConnectionOperation, ParameterAccess, Root, Value},
    pipeline::{Matcher, Pipeline, SessionEvent},
    tree::{Element, Tree},
};
use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};
use tokio::sync::{Mutex, broadcast};
#[cfg(feature = "tracing")]
use tracing::{info, warn};

/// Result of an `invoke` round trip, correlated by invocation id rather than path.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub invocation_id: i32,
    pub success: Option<bool>,
    pub result: Option<Vec<Value>>,
}

struct Session {
    pipeline: Pipeline,
}

pub struct EmberClient {
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    session: Mutex<Option<Session>>,
    next_invocation_id: AtomicI32,
}

impl EmberClient {
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            events,
            session: Mutex::new(None),
            next_invocation_id: AtomicI32::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribes to the session's event stream (connection lifecycle,
    /// value changes, invocation results).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn connect(&self, timeout: Duration) -> EmberResult<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Err(EmberError::InvalidRequest("already connected".into()));
        }

        let addr = self
            .config
            .socket_addr()
            .ok_or_else(|| EmberError::InvalidRequest(format!("invalid host '{}'", self.config.host)))?;

        let _ = self.events.send(SessionEvent::Connecting);

        let outcome = tokio::time::timeout(
            timeout,
            start_tcp_consumer(addr, Some(self.config.keep_alive_interval), false),
        )
        .await;

        let (tx, rx) = match outcome {
            Ok(Ok(channels)) => channels,
            Ok(Err(e)) => {
                #[cfg(feature = "tracing")]
                warn!("Connection to {addr} failed: {e}");
                let _ = self.events.send(SessionEvent::Error(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                warn!("Connection to {addr} timed out after {timeout:?}");
                let _ = self.events.send(SessionEvent::Error("connect timed out".into()));
                return Err(EmberError::Timeout);
            }
        };

        let pipeline = Pipeline::spawn(tx, rx, self.events.clone());
        *guard = Some(Session { pipeline });
        #[cfg(feature = "tracing")]
        info!("Connected to {addr}.");
        let _ = self.events.send(SessionEvent::Connected);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.pipeline.disconnect().await;
            #[cfg(feature = "tracing")]
            info!("Disconnected.");
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    async fn pipeline(&self) -> EmberResult<Pipeline> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.pipeline.clone())
            .ok_or(EmberError::ConnectionClosed)
    }

    /// Requests the children of `path` (or the top-level nodes, for an
    /// empty path) and returns them once the peer's response has been
    /// merged into the local mirror.
    pub async fn get_directory(&self, path: &[i32]) -> EmberResult<Vec<Element>> {
        let pipeline = self.pipeline().await?;
        let root = Tree::get_directory_request(path, None);
        pipeline
            .submit(
                root,
                Matcher::GetDirectory {
                    target: path.to_vec(),
                },
                self.config.request_timeout,
            )
            .await?;

        let tree = pipeline.tree().lock().unwrap();
        let children = if path.is_empty() {
            tree.root().iter().cloned().collect()
        } else {
            tree.get_element_by_path(path)
                .map(|e| e.children().iter().cloned().collect())
                .unwrap_or_default()
        };
        Ok(children)
    }

    /// Resolves `path` against the local mirror, expanding unknown ancestors
    /// one level at a time via `getDirectory`. Gives up once the same
    /// ancestor fails to reveal a new segment twice in a row.
    pub async fn get_element_by_path(&self, path: &[i32]) -> EmberResult<Element> {
        if path.is_empty() {
            return Err(EmberError::InvalidRequest("path must not be empty".into()));
        }
        let pipeline = self.pipeline().await?;
        let mut stalled = 0;
        loop {
            if let Some(element) = pipeline.tree().lock().unwrap().get_element_by_path(path) {
                return Ok(element.clone());
            }
            let known_before = self.deepest_known_prefix(&pipeline, path);
            self.get_directory(&known_before).await?;
            let known_after = self.deepest_known_prefix(&pipeline, path);
            if known_after.len() == known_before.len() {
                stalled += 1;
                if stalled >= 2 {
                    return Err(EmberError::PathNotFound(format_path(path)));
                }
            } else {
                stalled = 0;
            }
        }
    }

    /// Convenience over [`EmberClient::get_element_by_path`] for a
    /// dot-separated path such as `"1.2.3"`.
    pub async fn get_element_by_path_str(&self, path: &str) -> EmberResult<Element> {
        let parsed = parse_path(path)?;
        self.get_element_by_path(&parsed).await
    }

    fn deepest_known_prefix(&self, pipeline: &Pipeline, path: &[i32]) -> Vec<i32> {
        let tree = pipeline.tree().lock().unwrap();
        let mut depth = 0;
        while depth < path.len() && tree.get_element_by_path(&path[..=depth]).is_some() {
            depth += 1;
        }
        path[..depth].to_vec()
    }

    pub async fn set_value(&self, path: &[i32], value: Value) -> EmberResult<Element> {
        let pipeline = self.pipeline().await?;
        {
            let tree = pipeline.tree().lock().unwrap();
            if let Some(element) = tree.get_element_by_path(path) {
                if !matches!(element, Element::Parameter(_)) {
                    return Err(EmberError::InvalidRequest(format!(
                        "{} is not a parameter",
                        format_path(path)
                    )));
                }
            }
        }
        let root = Tree::set_value_request(path, value.clone());
        pipeline
            .submit(
                root,
                Matcher::SetValue {
                    target: path.to_vec(),
                },
                self.config.request_timeout,
            )
            .await?;
        let element = pipeline
            .tree()
            .lock()
            .unwrap()
            .get_element_by_path(path)
            .cloned()
            .ok_or_else(|| EmberError::PathNotFound(format_path(path)))?;
        // A peer that denies the write echoes the parameter back with its
        // old value untouched and an access level that excludes writing.
        if let Element::Parameter(ref param) = element {
            let write_denied = matches!(
                param.access,
                Some(ParameterAccess::None) | Some(ParameterAccess::Read)
            ) && param.value.as_ref() != Some(&value);
            if write_denied {
                return Err(EmberError::AccessError(format_path(path)));
            }
        }
        Ok(element)
    }

    pub async fn invoke_function(&self, path: &[i32], args: Vec<Value>) -> EmberResult<InvocationOutcome> {
        let pipeline = self.pipeline().await?;
        let invocation_id = self.next_invocation_id.fetch_add(1, Ordering::Relaxed);
        let root = Tree::invoke_request(path, invocation_id, args);
        let reply = pipeline
            .submit(
                root,
                Matcher::Invocation { id: invocation_id },
                self.config.request_timeout,
            )
            .await?;
        match reply {
            Root::InvocationResult(result) => Ok(InvocationOutcome {
                invocation_id: result.invocation_id,
                success: result.success,
                result: result.result.map(|t| t.0),
            }),
            _ => Err(EmberError::Deserialization(
                "expected an invocation result".into(),
            )),
        }
    }

    pub async fn matrix_connect(&self, matrix: &[i32], target: i32, sources: &[i32]) -> EmberResult<Element> {
        self.matrix_op(matrix, target, sources, ConnectionOperation::Connect)
            .await
    }

    pub async fn matrix_disconnect(&self, matrix: &[i32], target: i32) -> EmberResult<Element> {
        self.matrix_op(matrix, target, &[], ConnectionOperation::Disconnect)
            .await
    }

    pub async fn matrix_set_connection(
        &self,
        matrix: &[i32],
        target: i32,
        sources: &[i32],
    ) -> EmberResult<Element> {
        self.matrix_op(matrix, target, sources, ConnectionOperation::Absolute)
            .await
    }

    async fn matrix_op(
        &self,
        matrix: &[i32],
        target: i32,
        sources: &[i32],
        operation: ConnectionOperation,
    ) -> EmberResult<Element> {
        let pipeline = self.pipeline().await?;
        let (target_count, source_count) = {
            let tree = pipeline.tree().lock().unwrap();
            match tree.get_element_by_path(matrix).and_then(Element::as_matrix) {
                Some(m) => (m.target_count, m.source_count),
                None => {
                    return Err(EmberError::InvalidRequest(format!(
                        "{} is not a known matrix",
                        format_path(matrix)
                    )));
                }
            }
        };
        if target < 1 || target > target_count {
            return Err(EmberError::InvalidConnection(format!(
                "target {target} outside 1..={target_count}"
            )));
        }
        if let Some(&bad) = sources.iter().find(|&&s| s < 1 || s > source_count) {
            return Err(EmberError::InvalidConnection(format!(
                "source {bad} outside 1..={source_count}"
            )));
        }

        let root = Tree::connect_request(matrix, target, sources, operation);
        pipeline
            .submit(
                root,
                Matcher::MatrixOp {
                    target: matrix.to_vec(),
                },
                self.config.request_timeout,
            )
            .await?;
        pipeline
            .tree()
            .lock()
            .unwrap()
            .get_element_by_path(matrix)
            .cloned()
            .ok_or_else(|| EmberError::PathNotFound(format_path(matrix)))
    }

    pub async fn subscribe(&self, path: &[i32]) -> EmberResult<()> {
        let pipeline = self.pipeline().await?;
        let root = Tree::subscribe_request(path);
        pipeline
            .submit(root, Matcher::FireAndForget, self.config.request_timeout)
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, path: &[i32]) -> EmberResult<()> {
        let pipeline = self.pipeline().await?;
        let root = Tree::unsubscribe_request(path);
        pipeline
            .submit(root, Matcher::FireAndForget, self.config.request_timeout)
            .await?;
        Ok(())
    }

    /// BER-encodes the current local mirror as a single Ember+ root and
    /// writes it to `sink`.
    pub async fn save_tree(&self, sink: &mut impl std::io::Write) -> EmberResult<()> {
        let pipeline = self.pipeline().await?;
        let root = pipeline.tree().lock().unwrap().to_root();
        let encoded = rasn::ber::encode(&root)?;
        sink.write_all(&encoded)?;
        Ok(())
    }
}

fn format_path(path: &[i32]) -> String {
    path.iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_path(path: &str) -> EmberResult<Vec<i32>> {
    path.split('.')
        .map(|segment| {
            segment
                .parse::<i32>()
                .map_err(|_| EmberError::InvalidRequest(format!("malformed path '{path}'")))
        })
        .collect()
}

#[cfg(test)]
impl EmberClient {
    fn with_pipeline(pipeline: Pipeline, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            config: SessionConfig::new("127.0.0.1"),
            events,
            session: Mutex::new(Some(Session { pipeline })),
            next_invocation_id: AtomicI32::new(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::MatrixData;

    #[tokio::test]
    async fn matrix_connect_rejects_out_of_range_source() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (_in_tx, in_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx.clone());
        pipeline
            .tree()
            .lock()
            .unwrap()
            .add_child(crate::tree::Element::Matrix(MatrixData {
                number: 1,
                identifier: Some("router".into()),
                target_count: 4,
                source_count: 2,
                ..Default::default()
            }))
            .unwrap();

        let client = EmberClient::with_pipeline(pipeline, events_tx);
        let err = client
            .matrix_connect(&[1], 1, &[5])
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::InvalidConnection(_)));
    }

    #[tokio::test]
    async fn matrix_connect_accepts_one_indexed_ids_within_count() {
        // spec scenario: matrixConnect(m, target=3, sources=[1,2]) with sourceCount=2 is accepted.
        let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (_in_tx, in_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx.clone());
        pipeline
            .tree()
            .lock()
            .unwrap()
            .add_child(crate::tree::Element::Matrix(MatrixData {
                number: 1,
                identifier: Some("router".into()),
                target_count: 4,
                source_count: 2,
                ..Default::default()
            }))
            .unwrap();

        let client = EmberClient::with_pipeline(pipeline, events_tx);
        let call = client.matrix_connect(&[1], 3, &[1, 2]);
        tokio::pin!(call);
        tokio::select! {
            _ = &mut call => panic!("should not resolve without a peer reply"),
            frame = out_rx.recv() => assert!(frame.is_some(), "preflight should have let the request through"),
        }
    }

    #[tokio::test]
    async fn matrix_connect_rejects_unknown_matrix() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (_in_tx, in_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx.clone());
        let client = EmberClient::with_pipeline(pipeline, events_tx);
        let err = client.matrix_connect(&[9], 0, &[0]).await.unwrap_err();
        assert!(matches!(err, EmberError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn set_value_rejects_known_non_parameter() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (_in_tx, in_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx.clone());
        pipeline
            .tree()
            .lock()
            .unwrap()
            .add_child(crate::tree::Element::Node(crate::tree::NodeData {
                number: 1,
                ..Default::default()
            }))
            .unwrap();
        let client = EmberClient::with_pipeline(pipeline, events_tx);
        let err = client
            .set_value(&[1], Value::Integer(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn set_value_surfaces_access_error_when_peer_denies_write() {
        use crate::glow::{
            Element as GlowElement, Parameter, ParameterContents, RootElement, RootElementCollection,
        };
        use crate::tree::ParameterData;

        let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (in_tx, in_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx.clone());
        pipeline
            .tree()
            .lock()
            .unwrap()
            .add_child(crate::tree::Element::Parameter(ParameterData {
                number: 1,
                value: Some(Value::Integer(1)),
                access: Some(ParameterAccess::Read),
                ..Default::default()
            }))
            .unwrap();

        let client = EmberClient::with_pipeline(pipeline, events_tx);
        let call = client.set_value(&[1], Value::Integer(2));
        tokio::pin!(call);

        tokio::select! {
            _ = &mut call => panic!("should not resolve before the peer echo arrives"),
            frame = out_rx.recv() => assert!(frame.is_some()),
        }

        // Peer denies the write: it echoes the parameter back unchanged.
        in_tx
            .send(Root::Elements(RootElementCollection(vec![RootElement::Element(
                GlowElement::Parameter(Parameter {
                    number: 1,
                    contents: Some(ParameterContents {
                        identifier: None,
                        description: None,
                        value: Some(Value::Integer(1)),
                        minimum: None,
                        maximum: None,
                        access: Some(ParameterAccess::Read),
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
            )])))
            .await
            .unwrap();

        let err = call.await.unwrap_err();
        assert!(matches!(err, EmberError::AccessError(_)));
    }

    #[tokio::test]
    async fn save_tree_encodes_current_mirror() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (_in_tx, in_rx) = tokio::sync::mpsc::channel::<Root>(4);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let pipeline = Pipeline::spawn(out_tx, in_rx, events_tx.clone());
        pipeline
            .tree()
            .lock()
            .unwrap()
            .add_child(crate::tree::Element::Node(crate::tree::NodeData {
                number: 1,
                identifier: Some("box".into()),
                ..Default::default()
            }))
            .unwrap();
        let client = EmberClient::with_pipeline(pipeline, events_tx);
        let mut buf = Vec::new();
        client.save_tree(&mut buf).await.unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn parse_path_splits_on_dots() {
        assert_eq!(parse_path("1.2.3").unwrap(), vec![1, 2, 3]);
        assert!(parse_path("1.x.3").is_err());
    }
}
