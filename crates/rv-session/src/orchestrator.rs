//! Session orchestration
//!
//! Drives one run of a program against the evaluation server:
//!
//! ```text
//! Idle -> Cloned -> Evaluating(ns) -> Evaluating(body) -> Closed
//!                        \                  /
//!                         -> Interrupting -
//! ```
//!
//! Requests are issued one at a time. Cancellation is observed at every
//! exchange; a cancelled evaluation is interrupted, the multiplexer is torn
//! down and the session is still closed before `Cancelled` is returned.

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use rv_core::config::{ClientConfig, MultiplexMode};
use rv_core::{
    segment, CompletionPolicy, ExceptionCause, Form, RemoteException, RunContext, RunError,
    Transport,
};
use rv_protocol::{Message, Request, SessionId, Value};

use crate::console::LocalIo;
use crate::multiplexer::{self, Multiplexer};
use crate::wrap::wrap_body;

/// Runs programs over a [`Transport`]
pub struct Orchestrator<T> {
    transport: T,
    config: ClientConfig,
    ctx: RunContext,
    io: LocalIo,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(transport: T, config: ClientConfig, ctx: RunContext, io: LocalIo) -> Self {
        Self {
            transport,
            config,
            ctx,
            io,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Evaluate `source` in a fresh session
    ///
    /// The source is segmented before any network activity, so unbalanced
    /// input fails without touching the server. A leading `ns` form is
    /// evaluated on its own and names the namespace for the rest; the
    /// remaining forms go out as one wrapped `eval`. Output is written to the
    /// local console while the evaluation runs. The session is closed on
    /// every path once it exists.
    ///
    /// # Arguments
    /// * `source` - Complete program text
    /// * `cancel` - Token cancelled on Ctrl-C/SIGTERM; a pending evaluation
    ///   is interrupted before the session is closed
    ///
    /// # Returns
    /// `Ok(())` when every form evaluated without an exception, including an
    /// empty program.
    ///
    /// # Errors
    /// * [`RunError::UnbalancedSource`] - nothing was sent
    /// * [`RunError::RemoteEvaluation`] - the program threw; carries the
    ///   class, message and cause chain from a `stacktrace` request
    /// * [`RunError::Cancelled`] - `cancel` fired
    /// * [`RunError::SessionCloneFailed`], [`RunError::ServerUnreachable`],
    ///   [`RunError::ResponseTimeout`], [`RunError::Protocol`] - the server
    ///   failed or misbehaved
    pub async fn run(&mut self, source: &str, cancel: &CancellationToken) -> Result<(), RunError> {
        let forms = segment(source)?;
        if forms.is_empty() {
            tracing::info!("Nothing to evaluate");
            return Ok(());
        }
        tracing::debug!("Evaluating {} top-level forms", forms.len());

        let session = self.clone_session(cancel).await?;
        tracing::info!("Opened {}", session);

        let result = self.evaluate(&session, forms, cancel).await;

        if cancel.is_cancelled() {
            tracing::debug!("Cancellation requested; closing session anyway");
        }
        self.close_session(&session).await;

        tracing::debug!("Run finished after {:?}", self.ctx.elapsed());
        result
    }

    async fn clone_session(&self, cancel: &CancellationToken) -> Result<SessionId, RunError> {
        let request = Request::clone_session().with("id", self.ctx.next_request_id());
        let messages = self
            .exchange(&request, CompletionPolicy::Expect(1), cancel, &mut |_: &Message| {})
            .await?;

        messages
            .iter()
            .find_map(Message::new_session)
            .ok_or(RunError::SessionCloneFailed)
    }

    async fn evaluate(
        &mut self,
        session: &SessionId,
        mut forms: Vec<Form>,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let namespace = match forms.first().and_then(Form::namespace).map(str::to_string) {
            Some(namespace) => {
                let declaration = forms.remove(0);
                self.eval_namespace(session, &declaration, cancel).await?;
                namespace
            }
            None => self.config.namespace.clone(),
        };

        if forms.is_empty() {
            return Ok(());
        }

        let mut multiplexer = self.start_multiplexer();
        if multiplexer.is_none() {
            self.forward_stdin(session, cancel).await?;
        }

        let channels = multiplexer.as_ref().map(|m| m.channels().clone());
        let code = wrap_body(&forms, self.ctx.args(), channels.as_ref());
        let request = Request::eval(session, code)
            .with("ns", namespace.clone())
            .with("id", self.ctx.next_request_id());

        tracing::info!("Evaluating program in namespace {}", namespace);
        let mut observer = self.console_observer();
        let result = self
            .eval_request(session, &request, self.config.completion.policy(), cancel, &mut observer)
            .await;

        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                if let Some(multiplexer) = multiplexer.take() {
                    multiplexer.abort();
                }
                return Err(e);
            }
        };

        if let Some(multiplexer) = multiplexer.take() {
            multiplexer.finish(self.config.drain_timeout).await;
        }

        match messages.iter().find(|m| m.is_exception()) {
            Some(exception) => Err(self.remote_exception(session, exception, cancel).await),
            None => Ok(()),
        }
    }

    async fn eval_namespace(
        &self,
        session: &SessionId,
        declaration: &Form,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let request =
            Request::eval(session, declaration.as_str()).with("id", self.ctx.next_request_id());
        let policy = CompletionPolicy::Expect(self.config.ns_expected_messages.max(1));

        let mut observer = self.console_observer();
        let messages = self
            .eval_request(session, &request, policy, cancel, &mut observer)
            .await?;

        match messages.iter().find(|m| m.is_exception()) {
            Some(exception) => Err(self.remote_exception(session, exception, cancel).await),
            None => Ok(()),
        }
    }

    /// Exchange an eval-like request, interrupting it if the run is cancelled
    async fn eval_request(
        &self,
        session: &SessionId,
        request: &Request,
        policy: CompletionPolicy,
        cancel: &CancellationToken,
        observer: &mut (dyn for<'m> FnMut(&'m Message) + Send),
    ) -> Result<Vec<Message>, RunError> {
        match self.exchange(request, policy, cancel, observer).await {
            Err(RunError::Cancelled) => {
                self.interrupt(session, request.get("id")).await;
                Err(RunError::Cancelled)
            }
            other => other,
        }
    }

    async fn exchange(
        &self,
        request: &Request,
        policy: CompletionPolicy,
        cancel: &CancellationToken,
        observer: &mut (dyn for<'m> FnMut(&'m Message) + Send),
    ) -> Result<Vec<Message>, RunError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunError::Cancelled),
            result = self.transport.send_observed(request, policy, observer) => Ok(result?),
        }
    }

    /// Writes `out`/`err` chunks to the local console as they arrive
    fn console_observer(&self) -> impl FnMut(&Message) + Send {
        let stdout = self.io.stdout.clone();
        let stderr = self.io.stderr.clone();

        move |message: &Message| {
            if let Some(out) = message.out() {
                if let Err(e) = stdout.write(out) {
                    tracing::warn!("Failed to write output: {}", e);
                }
            }
            if let Some(err) = message.err() {
                if let Err(e) = stderr.write(err) {
                    tracing::warn!("Failed to write error output: {}", e);
                }
            }
            if let Some(value) = message.value() {
                tracing::trace!("=> {}", value);
            }
        }
    }

    fn start_multiplexer(&mut self) -> Option<Multiplexer> {
        let wanted = match self.config.multiplex {
            MultiplexMode::Always => true,
            MultiplexMode::Never => false,
            MultiplexMode::Auto => self.io.redirected,
        };
        if !wanted {
            return None;
        }
        if !multiplexer::is_supported() {
            tracing::info!("Named pipes unavailable; streams go through the session");
            return None;
        }

        match Multiplexer::start(&self.config.pipe_root(), self.ctx.run_id(), &mut self.io) {
            Ok(multiplexer) => Some(multiplexer),
            Err(e) => {
                tracing::warn!("Failed to set up stream pipes, continuing without: {}", e);
                None
            }
        }
    }

    /// Send piped stdin to the session ahead of the body
    async fn forward_stdin(
        &mut self,
        session: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        if !self.io.stdin_piped {
            return Ok(());
        }
        let Some(mut stdin) = self.io.stdin.take() else {
            return Ok(());
        };

        let mut data = Vec::new();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            read = stdin.read_to_end(&mut data) => {
                read?;
            }
        }
        if data.is_empty() {
            return Ok(());
        }

        tracing::debug!("Forwarding {} bytes of input", data.len());
        let request = Request::stdin(session, data).with("id", self.ctx.next_request_id());
        self.exchange(&request, CompletionPolicy::Expect(1), cancel, &mut |_: &Message| {})
            .await?;
        Ok(())
    }

    /// Build the error for an evaluation that threw, enriched with its causes
    async fn remote_exception(
        &self,
        session: &SessionId,
        exception: &Message,
        cancel: &CancellationToken,
    ) -> RunError {
        let class = exception
            .root_ex()
            .or_else(|| exception.ex())
            .map(|ex| ex.strip_prefix("class ").unwrap_or(ex))
            .unwrap_or("unknown exception")
            .to_string();

        let request = Request::stacktrace(session).with("id", self.ctx.next_request_id());
        let policy = self.config.completion.policy();
        let causes = match self
            .exchange(&request, policy, cancel, &mut |_: &Message| {})
            .await
        {
            Ok(messages) => exception_causes(&messages),
            Err(RunError::Cancelled) => return RunError::Cancelled,
            Err(e) => {
                tracing::warn!("Failed to fetch stack trace: {}", e);
                Vec::new()
            }
        };

        let (class, message) = match causes.first() {
            Some(cause) => (cause.class.clone(), cause.message.clone()),
            None => (class, String::new()),
        };

        RunError::RemoteEvaluation(RemoteException {
            class,
            message,
            causes,
        })
    }

    async fn interrupt(&self, session: &SessionId, pending: Option<&str>) {
        let mut request = Request::interrupt(session).with("id", self.ctx.next_request_id());
        if let Some(id) = pending {
            request = request.with("interrupt-id", id.to_string());
        }

        tracing::info!("Interrupting evaluation in {}", session);
        let timeout = self.config.interrupt_timeout;
        match tokio::time::timeout(timeout, self.transport.send(&request, CompletionPolicy::Expect(1)))
            .await
        {
            Ok(Ok(_)) => tracing::debug!("Interrupt acknowledged"),
            Ok(Err(e)) => tracing::warn!("Interrupt failed: {}", e),
            Err(_) => tracing::warn!("No interrupt acknowledgement within {:?}", timeout),
        }
    }

    async fn close_session(&self, session: &SessionId) {
        let request = Request::close(session).with("id", self.ctx.next_request_id());
        match self.transport.send(&request, CompletionPolicy::Expect(1)).await {
            Ok(_) => tracing::info!("Closed {}", session),
            Err(e) => tracing::warn!("Failed to close {}: {}", session, e),
        }
    }
}

/// Every stacktrace message naming a class is one cause, outermost first
fn exception_causes(messages: &[Message]) -> Vec<ExceptionCause> {
    messages
        .iter()
        .filter_map(|m| {
            let class = m.class()?;
            let frames = m
                .field("stacktrace")
                .and_then(Value::as_list)
                .map(|frames| frames.iter().filter_map(render_frame).collect())
                .unwrap_or_default();

            Some(ExceptionCause {
                class: class.to_string(),
                message: m.message().unwrap_or_default().to_string(),
                frames,
            })
        })
        .collect()
}

/// Render a frame map as `class.method (file:line)`
fn render_frame(frame: &Value) -> Option<String> {
    let entries = frame.as_dict()?;
    let text = |key: &str| entries.get(key.as_bytes()).and_then(Value::as_str);

    let class = text("class").or_else(|| text("name"))?;
    let location = match (text("file"), entries.get("line".as_bytes())) {
        (Some(file), Some(Value::Int(line))) => format!("{}:{}", file, line),
        (Some(file), _) => file.to_string(),
        (None, _) => "Unknown Source".to_string(),
    };

    Some(match text("method") {
        Some(method) => format!("{}.{} ({})", class, method, location),
        None => format!("{} ({})", class, location),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rv_core::TransportError;
    use rv_protocol::{decode, Op};

    use crate::console::CaptureBuffer;

    fn message(encoded: &str) -> Message {
        Message::try_from(decode(encoded.as_bytes()).unwrap()).unwrap()
    }

    /// Replays canned responses per operation and records every request
    #[derive(Default)]
    struct MockTransport {
        requests: Mutex<Vec<Request>>,
        replies: Mutex<HashMap<Op, VecDeque<Vec<Message>>>>,
        hang_on_eval: bool,
    }

    impl MockTransport {
        fn reply(self, op: Op, encoded: &[&str]) -> Self {
            self.replies
                .lock()
                .unwrap()
                .entry(op)
                .or_default()
                .push_back(encoded.iter().map(|e| message(e)).collect());
            self
        }

        fn hanging(mut self) -> Self {
            self.hang_on_eval = true;
            self
        }

        fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        fn ops(&self) -> Vec<Op> {
            self.requests().iter().map(Request::op).collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_observed(
            &self,
            request: &Request,
            _policy: CompletionPolicy,
            observer: &mut (dyn for<'m> FnMut(&'m Message) + Send),
        ) -> Result<Vec<Message>, TransportError> {
            self.requests.lock().unwrap().push(request.clone());

            if self.hang_on_eval && request.op() == Op::Eval {
                std::future::pending::<()>().await;
            }

            let batch = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&request.op())
                .and_then(VecDeque::pop_front)
                .unwrap_or_default();
            for m in &batch {
                observer(m);
            }
            Ok(batch)
        }
    }

    fn session_server() -> MockTransport {
        MockTransport::default()
            .reply(Op::Clone, &["d11:new-session2:s1e"])
            .reply(Op::Close, &["d6:statusl4:doneee"])
    }

    fn orchestrator(
        transport: MockTransport,
        args: Vec<String>,
        stdin: Option<&'static [u8]>,
    ) -> (Orchestrator<MockTransport>, CaptureBuffer, CaptureBuffer) {
        let stdout = CaptureBuffer::new();
        let stderr = CaptureBuffer::new();
        let stdin = stdin.map(|data| Box::new(data) as crate::console::InputStream);
        let io = LocalIo::new(stdin, stdout.sink(), stderr.sink());
        let config = ClientConfig {
            multiplex: MultiplexMode::Never,
            ..ClientConfig::default()
        };

        let orchestrator = Orchestrator::new(transport, config, RunContext::new(args, false), io);
        (orchestrator, stdout, stderr)
    }

    #[tokio::test]
    async fn test_empty_source_sends_nothing() {
        let (mut orch, _, _) = orchestrator(session_server(), vec![], None);
        orch.run("  ; only a comment\n", &CancellationToken::new())
            .await
            .unwrap();
        assert!(orch.transport().ops().is_empty());
    }

    #[tokio::test]
    async fn test_unbalanced_source_sends_nothing() {
        let (mut orch, _, _) = orchestrator(session_server(), vec![], None);
        let result = orch
            .run("(println \"unterminated", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RunError::UnbalancedSource(_))));
        assert!(orch.transport().ops().is_empty());
    }

    #[tokio::test]
    async fn test_clone_eval_close() {
        let transport = session_server().reply(
            Op::Eval,
            &["d3:out6:hello\ne", "d3:err4:warne", "d5:value3:nile", "d6:statusl4:doneee"],
        );
        let (mut orch, stdout, stderr) = orchestrator(transport, vec![], None);

        orch.run("(println \"hello\")", &CancellationToken::new())
            .await
            .unwrap();

        let requests = orch.transport().requests();
        assert_eq!(
            orch.transport().ops(),
            vec![Op::Clone, Op::Eval, Op::Close]
        );
        assert_eq!(requests[1].get("session"), Some("s1"));
        assert_eq!(requests[1].get("ns"), Some("user"));
        assert!(requests[1].get("code").unwrap().contains("load-string"));
        assert_eq!(requests[2].get("session"), Some("s1"));
        assert_eq!(stdout.contents(), "hello\n");
        assert_eq!(stderr.contents(), "warn");
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let (mut orch, _, _) = orchestrator(session_server(), vec![], None);
        orch.run("(+ 1 2)", &CancellationToken::new()).await.unwrap();

        let ids: Vec<String> = orch
            .transport()
            .requests()
            .iter()
            .map(|r| r.get("id").unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids[0].ends_with("-1"));
        assert!(ids[2].ends_with("-3"));
    }

    #[tokio::test]
    async fn test_missing_session_token() {
        let transport = MockTransport::default().reply(Op::Clone, &["d6:statusl4:doneee"]);
        let (mut orch, _, _) = orchestrator(transport, vec![], None);

        let result = orch.run("(+ 1 2)", &CancellationToken::new()).await;

        assert!(matches!(result, Err(RunError::SessionCloneFailed)));
        assert_eq!(orch.transport().ops(), vec![Op::Clone]);
    }

    #[tokio::test]
    async fn test_namespace_declaration_is_evaluated_first() {
        let transport = session_server()
            .reply(Op::Eval, &["d2:ns8:demo.appe", "d6:statusl4:doneee"])
            .reply(Op::Eval, &["d6:statusl4:doneee"]);
        let (mut orch, _, _) = orchestrator(transport, vec![], None);

        orch.run("(ns demo.app)\n(defn -main [] 1)\n(-main)", &CancellationToken::new())
            .await
            .unwrap();

        let requests = orch.transport().requests();
        assert_eq!(
            orch.transport().ops(),
            vec![Op::Clone, Op::Eval, Op::Eval, Op::Close]
        );
        assert_eq!(requests[1].get("code"), Some("(ns demo.app)"));
        assert_eq!(requests[2].get("ns"), Some("demo.app"));
        assert!(!requests[2].get("code").unwrap().contains("(ns demo.app)"));
    }

    #[tokio::test]
    async fn test_namespace_only_program() {
        let transport = session_server().reply(Op::Eval, &["d2:ns4:demoe"]);
        let (mut orch, _, _) = orchestrator(transport, vec![], None);

        orch.run("(ns demo)", &CancellationToken::new()).await.unwrap();
        assert_eq!(
            orch.transport().ops(),
            vec![Op::Clone, Op::Eval, Op::Close]
        );
    }

    #[tokio::test]
    async fn test_exception_fetches_stacktrace() {
        let transport = session_server()
            .reply(
                Op::Eval,
                &[
                    "d3:err37:Execution error (ArithmeticException)e",
                    "d2:ex35:class java.lang.ArithmeticException7:root-ex35:class java.lang.ArithmeticException6:statusl10:eval-erroree",
                    "d6:statusl4:doneee",
                ],
            )
            .reply(
                Op::Stacktrace,
                &[
                    "d5:class29:java.lang.ArithmeticException7:message14:Divide by zero10:stacktraceld5:class20:clojure.lang.Numbers4:file12:Numbers.java4:linei188e6:method6:divideeee",
                    "d6:statusl4:doneee",
                ],
            );
        let (mut orch, _, stderr) = orchestrator(transport, vec![], None);

        let result = orch.run("(/ 1 0)", &CancellationToken::new()).await;

        let exception = match result {
            Err(RunError::RemoteEvaluation(exception)) => exception,
            other => panic!("expected remote evaluation error, got {:?}", other),
        };
        assert_eq!(exception.class, "java.lang.ArithmeticException");
        assert_eq!(exception.message, "Divide by zero");
        assert_eq!(exception.causes.len(), 1);
        assert_eq!(
            exception.causes[0].frames,
            vec!["clojure.lang.Numbers.divide (Numbers.java:188)"]
        );
        assert_eq!(
            orch.transport().ops(),
            vec![Op::Clone, Op::Eval, Op::Stacktrace, Op::Close]
        );
        assert!(stderr.contents().contains("ArithmeticException"));
    }

    #[tokio::test]
    async fn test_exception_without_stacktrace_support() {
        let transport = session_server().reply(
            Op::Eval,
            &["d2:ex32:class clojure.lang.ExceptionInfo6:statusl10:eval-erroree"],
        );
        let (mut orch, _, _) = orchestrator(transport, vec![], None);

        let result = orch.run("(throw (ex-info \"boom\" {}))", &CancellationToken::new()).await;

        match result {
            Err(RunError::RemoteEvaluation(exception)) => {
                assert_eq!(exception.class, "clojure.lang.ExceptionInfo");
                assert!(exception.causes.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_and_closes() {
        let transport = session_server()
            .reply(Op::Interrupt, &["d6:statusl4:doneee"])
            .hanging();
        let (mut orch, _, _) = orchestrator(transport, vec![], None);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = orch.run("(Thread/sleep 100000)", &cancel).await;

        assert!(matches!(result, Err(RunError::Cancelled)));
        let requests = orch.transport().requests();
        assert_eq!(
            orch.transport().ops(),
            vec![Op::Clone, Op::Eval, Op::Interrupt, Op::Close]
        );
        assert_eq!(requests[2].get("interrupt-id"), requests[1].get("id"));
        assert_eq!(requests[2].get("session"), Some("s1"));
    }

    #[tokio::test]
    async fn test_cancelled_before_clone() {
        let (mut orch, _, _) = orchestrator(session_server(), vec![], None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orch.run("(+ 1 2)", &cancel).await;

        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(orch.transport().ops().is_empty());
    }

    #[tokio::test]
    async fn test_piped_stdin_is_forwarded() {
        let (mut orch, _, _) = orchestrator(session_server(), vec![], Some(b"line one\n"));
        orch.run("(println (read-line))", &CancellationToken::new())
            .await
            .unwrap();

        let requests = orch.transport().requests();
        assert_eq!(
            orch.transport().ops(),
            vec![Op::Clone, Op::Stdin, Op::Eval, Op::Close]
        );
        assert_eq!(requests[1].get("stdin"), Some("line one\n"));
    }

    #[tokio::test]
    async fn test_arguments_are_bound() {
        let args = vec!["one".to_string(), "t\"wo".to_string()];
        let (mut orch, _, _) = orchestrator(session_server(), args, None);
        orch.run("(println *command-line-args*)", &CancellationToken::new())
            .await
            .unwrap();

        let code = orch.transport().requests()[1]
            .get("code")
            .unwrap()
            .to_string();
        assert!(code.contains(r#"*command-line-args* (list "one" "t\"wo")"#));
    }

    #[test]
    fn test_render_frame_without_line() {
        let frame = decode(b"d5:class4:user4:file14:NO_SOURCE_FILE6:method4:evale").unwrap();
        assert_eq!(
            render_frame(&frame).unwrap(),
            "user.eval (NO_SOURCE_FILE)"
        );
        assert!(render_frame(&Value::Int(1)).is_none());
    }
}
