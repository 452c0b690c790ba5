use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::host::HostEnvironment;

#[derive(Debug, Clone)]
pub struct DeobOptions {
    /// Wall-clock budget for one sandbox session, enforced from outside the
    /// interpreter thread.
    pub timeout: Duration,
    /// Hard backstop on repair rounds; the error-recurrence check alone does
    /// not bound runs where successive errors keep differing.
    pub max_rounds: usize,
}

impl Default for DeobOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), max_rounds: 25 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeobOutcome {
    /// The session ran to a verdict; the text is whatever the capture buffer
    /// collected (possibly empty).
    Completed(String),
    /// The sandbox thread missed its deadline and was abandoned.
    TimedOut,
    /// No sandbox is compiled in.
    Unavailable,
}

impl DeobOutcome {
    pub fn into_text(self) -> String {
        match self {
            DeobOutcome::Completed(text) => text,
            DeobOutcome::TimedOut | DeobOutcome::Unavailable => String::new(),
        }
    }
}

/// What the repair loop decided to do about one interpreter error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    /// The code buffer was rewritten; evaluate again.
    Retry,
    /// Bind the `$` shorthand to the global object, then evaluate again.
    BindGlobalAlias,
    /// No further progress is possible; return the capture buffer.
    Stop,
}

/// Mutable state for one repair-loop run: the code buffer, the previous
/// error signature, and the round count.
#[derive(Debug)]
pub struct RepairSession {
    pub code: String,
    last_error: Option<String>,
    rounds: usize,
    max_rounds: usize,
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("repair regex"))
}

fn undefined_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"([A-Za-z_$][0-9A-Za-z_$]*) is not defined")
}

fn line_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?:line[ :]+|@\s*)(\d+)")
}

fn fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"->\s*(.*)")
}

fn call_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"[\s=]?([A-Za-z_$][0-9A-Za-z_$.]*)\s*\(")
}

fn member_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"[=\s]([A-Za-z_$][0-9A-Za-z_$.]*)\s*\[")
}

fn assigned_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"=\s?.\(.*?\)")
}

impl RepairSession {
    pub fn new(code: impl Into<String>, max_rounds: usize) -> Self {
        Self { code: code.into(), last_error: None, rounds: 0, max_rounds }
    }

    /// Classifies one interpreter error and applies the corresponding patch
    /// to the code buffer. Recurring error messages and exhausted rounds
    /// stop the loop before any patch is attempted.
    pub fn diagnose(&mut self, message: &str) -> RepairStep {
        self.rounds += 1;
        if self.rounds > self.max_rounds {
            debug!(rounds = self.rounds, "Repair round budget exhausted");
            return RepairStep::Stop;
        }
        if self.last_error.as_deref() == Some(message) {
            return RepairStep::Stop;
        }
        self.last_error = Some(message.to_string());

        if message.contains("is not defined") {
            return self.patch_reference(message);
        }
        if message.contains("called on null or undefined") {
            return self.patch_null_target(message);
        }
        if message.contains("undefined is not a function")
            || message.contains("not a callable function")
        {
            return self.patch_unknown_call(message);
        }
        if lowercase(message).contains("cannot read property") {
            return self.patch_unknown_member(message);
        }
        if message.contains("SyntaxError") || message.contains("Syntax") {
            return self.patch_syntax(message);
        }
        RepairStep::Stop
    }

    /// `$` gets bound to the global object; any other unresolved identifier
    /// has its line commented out when the message locates one.
    fn patch_reference(&mut self, message: &str) -> RepairStep {
        if let Some(caps) = undefined_ident_re().captures(message) {
            if &caps[1] == "$" {
                return RepairStep::BindGlobalAlias;
            }
        }
        self.comment_out_reported_line(message)
    }

    /// Assignments that blow up on a null/undefined receiver get their
    /// right-hand side pointed at the mimicked `app` object.
    fn patch_null_target(&mut self, message: &str) -> RepairStep {
        let Some(fragment) = reported_fragment(message) else {
            return RepairStep::Stop;
        };
        let patched = if assigned_call_re().is_match(&fragment) {
            assigned_call_re().replace(&fragment, "=app").into_owned()
        } else if let Some(eq) = fragment.find('=') {
            format!("{}=app", &fragment[..eq])
        } else {
            return RepairStep::Stop;
        };
        self.replace_fragment(&fragment, &patched)
    }

    /// A call through a conditionally-defined helper: guess that the
    /// obfuscator meant dynamic evaluation and swap the callee for `eval`.
    fn patch_unknown_call(&mut self, message: &str) -> RepairStep {
        let Some(fragment) = reported_fragment(message) else {
            return RepairStep::Stop;
        };
        let Some(caps) = call_target_re().captures(&fragment) else {
            return RepairStep::Stop;
        };
        let patched = fragment.replacen(&caps[1], "eval", 1);
        self.replace_fragment(&fragment, &patched)
    }

    /// Member access on undefined resolves against `app`, the way a real
    /// viewer promotes unknown hosts.
    fn patch_unknown_member(&mut self, message: &str) -> RepairStep {
        let Some(fragment) = reported_fragment(message) else {
            return RepairStep::Stop;
        };
        let Some(caps) = member_target_re().captures(&fragment) else {
            return RepairStep::Stop;
        };
        let patched = fragment.replacen(&caps[1], "app", 1);
        self.replace_fragment(&fragment, &patched)
    }

    fn patch_syntax(&mut self, message: &str) -> RepairStep {
        self.comment_out_reported_line(message)
    }

    fn comment_out_reported_line(&mut self, message: &str) -> RepairStep {
        let Some(line_no) = line_number_re()
            .captures(message)
            .and_then(|caps| caps[1].parse::<usize>().ok())
        else {
            return RepairStep::Stop;
        };
        let mut lines: Vec<&str> = self.code.split('\n').collect();
        if line_no == 0 || line_no > lines.len() {
            return RepairStep::Stop;
        }
        let patched = format!("//{}", lines[line_no - 1]);
        lines[line_no - 1] = &patched;
        self.code = lines.join("\n");
        RepairStep::Retry
    }

    fn replace_fragment(&mut self, fragment: &str, patched: &str) -> RepairStep {
        if fragment.is_empty() || !self.code.contains(fragment) {
            return RepairStep::Stop;
        }
        self.code = self.code.replacen(fragment, patched, 1);
        RepairStep::Retry
    }
}

fn reported_fragment(message: &str) -> Option<String> {
    fragment_re()
        .captures(message)
        .map(|caps| caps[1].trim().to_string())
        .filter(|f| !f.is_empty())
}

fn lowercase(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// Runs the repair loop in an isolated sandbox and returns whatever the
/// capture buffer collected. Empty script short-circuits; without the
/// `js-sandbox` feature the outcome is `Unavailable`.
pub fn deobfuscate_with_env(
    script: &str,
    env: &HostEnvironment,
    options: &DeobOptions,
) -> DeobOutcome {
    if script.is_empty() {
        return DeobOutcome::Completed(String::new());
    }
    run_sandboxed(script, env, options)
}

#[cfg(feature = "js-sandbox")]
fn run_sandboxed(script: &str, env: &HostEnvironment, options: &DeobOptions) -> DeobOutcome {
    sandbox::run(script.to_string(), env.clone(), options.clone())
}

#[cfg(not(feature = "js-sandbox"))]
fn run_sandboxed(_script: &str, _env: &HostEnvironment, _options: &DeobOptions) -> DeobOutcome {
    DeobOutcome::Unavailable
}

#[cfg(feature = "js-sandbox")]
mod sandbox {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;

    use boa_engine::property::Attribute;
    use boa_engine::vm::RuntimeLimits;
    use boa_engine::{Context, JsArgs, JsString, JsValue, NativeFunction, Source};
    use tracing::{debug, warn};

    use super::{DeobOptions, DeobOutcome, RepairSession, RepairStep};
    use crate::host::HostEnvironment;

    pub fn run(script: String, env: HostEnvironment, options: DeobOptions) -> DeobOutcome {
        let timeout = options.timeout;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let out = run_session(&script, &env, options.max_rounds);
            let _ = tx.send(out);
        });
        match rx.recv_timeout(timeout) {
            Ok(text) => DeobOutcome::Completed(text),
            Err(_) => {
                // The thread cannot be killed; the interpreter's runtime
                // limits bound how long it can keep running detached.
                warn!(
                    security = true,
                    domain = "js.sandbox",
                    kind = "sandbox_timeout",
                    timeout_ms = timeout.as_millis() as u64,
                    "Sandbox session abandoned on timeout"
                );
                DeobOutcome::TimedOut
            }
        }
    }

    fn run_session(script: &str, env: &HostEnvironment, max_rounds: usize) -> String {
        let mut context = Context::default();
        let mut limits = RuntimeLimits::default();
        limits.set_loop_iteration_limit(100_000);
        limits.set_recursion_limit(64);
        limits.set_stack_size_limit(1024 * 1024);
        context.set_runtime_limits(limits);

        let capture = Rc::new(RefCell::new(String::new()));
        install_eval_capture(&mut context, capture.clone());
        install_host_objects(&mut context, env);

        let mut session = RepairSession::new(script, max_rounds);
        loop {
            match context.eval(Source::from_bytes(session.code.as_bytes())) {
                Ok(_) => break,
                Err(err) => {
                    let message = format!("{err}");
                    debug!(error = message.as_str(), "Sandbox evaluation error");
                    match session.diagnose(&message) {
                        RepairStep::Retry => continue,
                        RepairStep::BindGlobalAlias => {
                            let _ = context.eval(Source::from_bytes(b"$ = this;"));
                        }
                        RepairStep::Stop => break,
                    }
                }
            }
        }
        let text = capture.borrow().clone();
        text
    }

    /// Rebinds the dynamic-evaluation primitive: nested `eval` calls append
    /// their argument to the capture buffer instead of executing, which is
    /// how staged obfuscation surfaces without running further payload.
    fn install_eval_capture(context: &mut Context, capture: Rc<RefCell<String>>) {
        let eval_fn = unsafe {
            NativeFunction::from_closure(move |_this, args, ctx| {
                let expression = args.get_or_undefined(0).to_string(ctx)?;
                capture.borrow_mut().push_str(&expression.to_std_string_escaped());
                Ok(JsValue::undefined())
            })
        };
        let _ = context.register_global_builtin_callable(JsString::from("eval"), 1, eval_fn);
        let _ = context.register_global_property(
            JsString::from("evalCode"),
            JsString::from(""),
            Attribute::all(),
        );
    }

    /// Injects the mimicked host objects as data literals, then attaches the
    /// handful of method bindings scripts commonly probe for.
    fn install_host_objects(context: &mut Context, env: &HostEnvironment) {
        let mut snippets = vec![
            format!("app = {};", env.app),
            "app.doc.syncAnnotScan = function () {};".to_string(),
            "app.doc.getAnnots = function () { return app.doc.annots; };".to_string(),
            "app.eval = function (expression) { eval(expression); };".to_string(),
            "app.newDoc = function () { return ''; };".to_string(),
            format!("info = {};", env.info),
            "this.info = info;".to_string(),
            "this.eval = eval;".to_string(),
            format!("event = {};", env.event),
            "event.target.info = info;".to_string(),
        ];
        if let Some(fields) = env.info.as_object() {
            for (key, value) in fields {
                if key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && key.chars().next().is_some_and(|c| !c.is_ascii_digit())
                {
                    snippets.push(format!("this.{key} = {value};"));
                }
            }
        }
        for snippet in snippets {
            // Best-effort, as a damaged graph can yield odd values.
            let _ = context.eval(Source::from_bytes(snippet.as_bytes()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RepairSession, RepairStep};

    #[test]
    fn identical_error_twice_stops_before_patching() {
        let mut session = RepairSession::new("a\nb\nc", 25);
        let msg = "SyntaxError: unexpected token at line 2, col 1";
        assert_eq!(session.diagnose(msg), RepairStep::Retry);
        assert_eq!(session.code, "a\n//b\nc");
        assert_eq!(session.diagnose(msg), RepairStep::Stop);
        // The buffer was not patched a second time.
        assert_eq!(session.code, "a\n//b\nc");
    }

    #[test]
    fn dollar_shorthand_binds_global_alias() {
        let mut session = RepairSession::new("$('x');", 25);
        assert_eq!(
            session.diagnose("ReferenceError: $ is not defined"),
            RepairStep::BindGlobalAlias
        );
    }

    #[test]
    fn unlocatable_reference_stops() {
        let mut session = RepairSession::new("mystery();", 25);
        assert_eq!(session.diagnose("ReferenceError: mystery is not defined"), RepairStep::Stop);
    }

    #[test]
    fn reference_with_line_comments_it_out() {
        let mut session = RepairSession::new("ok();\nmystery();", 25);
        let step = session.diagnose("ReferenceError: mystery is not defined @ 2 ");
        assert_eq!(step, RepairStep::Retry);
        assert_eq!(session.code, "ok();\n//mystery();");
    }

    #[test]
    fn null_target_assignment_rewrites_to_app() {
        let mut session = RepairSession::new("var d = q(box);", 25);
        let msg = "TypeError: method called on null or undefined -> var d = q(box);";
        assert_eq!(session.diagnose(msg), RepairStep::Retry);
        assert_eq!(session.code, "var d =app;");
    }

    #[test]
    fn unknown_call_target_becomes_eval() {
        let mut session = RepairSession::new("helper(payload);", 25);
        let msg = "TypeError: undefined is not a function -> helper(payload);";
        assert_eq!(session.diagnose(msg), RepairStep::Retry);
        assert_eq!(session.code, "eval(payload);");
    }

    #[test]
    fn unknown_member_object_becomes_app() {
        let mut session = RepairSession::new("var v = table[i];", 25);
        let msg = "TypeError: Cannot read property '0' of undefined -> var v = table[i];";
        assert_eq!(session.diagnose(msg), RepairStep::Retry);
        assert_eq!(session.code, "var v = app[i];");
    }

    #[test]
    fn round_budget_is_a_hard_backstop() {
        let mut session = RepairSession::new("a\nb", 3);
        // Alternate line numbers so the recurrence check never fires.
        let msgs =
            ["SyntaxError: bad at line 1", "SyntaxError: bad at line 2", "SyntaxError: bad at line 1"];
        assert_eq!(session.diagnose(msgs[0]), RepairStep::Retry);
        assert_eq!(session.diagnose(msgs[1]), RepairStep::Retry);
        assert_eq!(session.diagnose(msgs[2]), RepairStep::Retry);
        assert_eq!(session.diagnose("SyntaxError: bad at line 2"), RepairStep::Stop);
    }
}
