//! Message router for a single channel.
//!
//! Inbound frames are classified with [`protocol::classify`]: control frames
//! are applied to the process (resize) or ignored (theme); everything else
//! is written to the process byte for byte. Outbound process output is
//! passed through without inspection.

use protocol::{classify, ChannelNotice, ControlFrame, FrameKind, Inbound};
use tracing::{debug, trace};

use crate::process::{ProcessError, ProcessEvent, PtyProcess};

/// The process operations the router needs.
///
/// Implemented by [`PtyProcess`]; tests substitute a recording fake.
#[allow(async_fn_in_trait)]
pub trait Terminal: Send + Sync {
    /// Writes raw input to the process.
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError>;

    /// Resizes the terminal. Best-effort.
    fn resize(&self, cols: u16, rows: u16);
}

impl Terminal for PtyProcess {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        PtyProcess::write(self, data).await
    }

    fn resize(&self, cols: u16, rows: u16) {
        PtyProcess::resize(self, cols, rows)
    }
}

/// What the router did with an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A resize was applied.
    Resized { cols: u16, rows: u16 },
    /// A theme frame was accepted and ignored.
    ThemeIgnored,
    /// Bytes were written to the process.
    Forwarded(usize),
    /// An empty frame; nothing to do.
    Empty,
}

/// Result of [`MessageRouter::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed<'p> {
    /// Fully handled without touching the process's input.
    Handled(RouteOutcome),
    /// Bytes to write to the process unchanged.
    Input(&'p [u8]),
}

/// A frame to be sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Process output, sent as a binary frame.
    Output(Vec<u8>),
    /// A human-readable notice, sent as a text frame.
    Notice(String),
}

/// Routes traffic between one channel and its process.
pub struct MessageRouter<'a, T: Terminal> {
    terminal: &'a T,
    channel_id: &'a str,
}

impl<'a, T: Terminal> MessageRouter<'a, T> {
    /// Creates a router bound to one process.
    pub fn new(terminal: &'a T, channel_id: &'a str) -> Self {
        Self {
            terminal,
            channel_id,
        }
    }

    /// Classifies one inbound frame and applies it if it is a control frame.
    ///
    /// Never blocks. Input is handed back so the caller decides how to
    /// deliver it.
    pub fn dispatch<'p>(&self, kind: FrameKind, payload: &'p [u8]) -> Routed<'p> {
        match classify(kind, payload) {
            Inbound::Control(ControlFrame::Resize { cols, rows }) => {
                debug!(channel_id = %self.channel_id, cols, rows, "Resize requested");
                self.terminal.resize(cols, rows);
                Routed::Handled(RouteOutcome::Resized { cols, rows })
            }
            Inbound::Control(ControlFrame::Theme { .. }) => {
                trace!(channel_id = %self.channel_id, "Ignoring theme frame");
                Routed::Handled(RouteOutcome::ThemeIgnored)
            }
            Inbound::Input([]) => Routed::Handled(RouteOutcome::Empty),
            Inbound::Input(bytes) => Routed::Input(bytes),
        }
    }

    /// Routes one inbound frame, writing input to the process.
    ///
    /// Only a failed write is an error; malformed control-looking text is
    /// forwarded as input like any other text.
    pub async fn route_inbound(
        &self,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<RouteOutcome, ProcessError> {
        match self.dispatch(kind, payload) {
            Routed::Handled(outcome) => Ok(outcome),
            Routed::Input(bytes) => {
                self.terminal.write(bytes).await?;
                Ok(RouteOutcome::Forwarded(bytes.len()))
            }
        }
    }
}

/// Converts a process event into the frame sent to the client.
pub fn route_outbound(event: ProcessEvent) -> OutboundFrame {
    match event {
        ProcessEvent::Data(bytes) => OutboundFrame::Output(bytes),
        ProcessEvent::Exit(info) => OutboundFrame::Notice(
            ChannelNotice::ProcessExited {
                code: info.code,
                signal: info.signal,
            }
            .to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ExitInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTerminal {
        written: Mutex<Vec<Vec<u8>>>,
        resizes: Mutex<Vec<(u16, u16)>>,
        fail_writes: bool,
    }

    impl Terminal for MockTerminal {
        async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
            if self.fail_writes {
                return Err(ProcessError::AlreadyExited("mock".to_string()));
            }
            self.written.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) {
            self.resizes.lock().unwrap().push((cols, rows));
        }
    }

    #[tokio::test]
    async fn test_resize_frame_resizes_and_writes_nothing() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");

        let outcome = router
            .route_inbound(FrameKind::Text, br#"{"type":"resize","cols":120,"rows":40}"#)
            .await
            .unwrap();

        assert_eq!(outcome, RouteOutcome::Resized { cols: 120, rows: 40 });
        assert_eq!(*term.resizes.lock().unwrap(), vec![(120, 40)]);
        assert!(term.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_theme_frame_is_ignored() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");

        let outcome = router
            .route_inbound(FrameKind::Text, br#"{"type":"theme","name":"dark"}"#)
            .await
            .unwrap();

        assert_eq!(outcome, RouteOutcome::ThemeIgnored);
        assert!(term.written.lock().unwrap().is_empty());
        assert!(term.resizes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keystrokes_are_forwarded_verbatim() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");

        router.route_inbound(FrameKind::Text, b"ls\r").await.unwrap();
        router
            .route_inbound(FrameKind::Binary, &[0x03, 0xff, 0x00])
            .await
            .unwrap();

        assert_eq!(
            *term.written.lock().unwrap(),
            vec![b"ls\r".to_vec(), vec![0x03, 0xff, 0x00]]
        );
    }

    #[tokio::test]
    async fn test_malformed_control_text_is_forwarded() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");
        let payload = br#"{"type":"resize","cols":0,"rows":24}"#;

        let outcome = router
            .route_inbound(FrameKind::Text, payload)
            .await
            .unwrap();

        assert_eq!(outcome, RouteOutcome::Forwarded(payload.len()));
        assert_eq!(*term.written.lock().unwrap(), vec![payload.to_vec()]);
        assert!(term.resizes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_binary_resize_lookalike_is_input() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");
        let payload = br#"{"type":"resize","cols":120,"rows":40}"#;

        router
            .route_inbound(FrameKind::Binary, payload)
            .await
            .unwrap();

        assert!(term.resizes.lock().unwrap().is_empty());
        assert_eq!(term.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_frame_writes_nothing() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");

        let outcome = router.route_inbound(FrameKind::Text, b"").await.unwrap();
        assert_eq!(outcome, RouteOutcome::Empty);
        assert!(term.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let term = MockTerminal {
            fail_writes: true,
            ..MockTerminal::default()
        };
        let router = MessageRouter::new(&term, "ch");

        let result = router.route_inbound(FrameKind::Text, b"x").await;
        assert!(matches!(result, Err(ProcessError::AlreadyExited(_))));

        // Resize still succeeds without touching the writer.
        assert!(router
            .route_inbound(FrameKind::Text, br#"{"type":"resize","cols":10,"rows":5}"#)
            .await
            .is_ok());
    }

    #[test]
    fn test_dispatch_applies_control_and_returns_input() {
        let term = MockTerminal::default();
        let router = MessageRouter::new(&term, "ch");

        assert_eq!(
            router.dispatch(FrameKind::Text, br#"{"type":"resize","cols":90,"rows":30}"#),
            Routed::Handled(RouteOutcome::Resized { cols: 90, rows: 30 })
        );
        assert_eq!(*term.resizes.lock().unwrap(), vec![(90, 30)]);

        let paste = vec![b'x'; 1 << 20];
        assert_eq!(
            router.dispatch(FrameKind::Binary, &paste),
            Routed::Input(&paste[..])
        );
        assert_eq!(
            router.dispatch(FrameKind::Text, b""),
            Routed::Handled(RouteOutcome::Empty)
        );
        assert!(term.written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outbound_data_is_untouched() {
        let bytes = br#"{"type":"resize","cols":1,"rows":1}"#.to_vec();
        assert_eq!(
            route_outbound(ProcessEvent::Data(bytes.clone())),
            OutboundFrame::Output(bytes)
        );
    }

    #[test]
    fn test_outbound_exit_becomes_notice() {
        let frame = route_outbound(ProcessEvent::Exit(ExitInfo {
            code: 0,
            signal: None,
        }));
        assert_eq!(
            frame,
            OutboundFrame::Notice("\r\n[process exited with code 0]\r\n".to_string())
        );
    }
}
