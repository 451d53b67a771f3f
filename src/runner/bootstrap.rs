//! Worker bootstrap
//!
//! The worker interpreter runs [`BOOTSTRAP`] with `-c`. It reads one
//! [`WorkerRequest`] from stdin, builds the restricted namespace, runs the
//! fragment and reports on the relay fd before exiting with `os._exit`.
//!
//! Exit codes: 0 completed, 1 exception recorded, 3 memory exhausted.

use crate::policy::VettedUnit;
use serde::Serialize;
use serde_json::{Map, Value};

/// File descriptor the worker writes relay records to
pub const RELAY_FD: i32 = 3;

/// Names the bootstrap injects into the fragment's globals
pub const RESERVED_NAMES: &[&str] = &["__builtins__", "__name__", "__doc__", "emit_artifact"];

/// Request written to the worker's stdin
#[derive(Debug, Serialize)]
pub struct WorkerRequest<'a> {
    pub source: &'a str,
    pub builtins: &'a [String],
    pub allowed_modules: &'a [String],
    pub capture_artifacts: bool,
    pub bindings: &'a Map<String, Value>,
    pub summary_limit: usize,
    pub relay_fd: i32,
}

impl<'a> WorkerRequest<'a> {
    pub fn new(unit: &'a VettedUnit, bindings: &'a Map<String, Value>, summary_limit: usize) -> Self {
        let namespace = unit.namespace();
        Self {
            source: unit.source(),
            builtins: &namespace.builtins,
            allowed_modules: &namespace.allowed_modules,
            capture_artifacts: namespace.artifact_channel,
            bindings,
            summary_limit,
            relay_fd: RELAY_FD,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub const BOOTSTRAP: &str = r#"import sys, os


def _fencebox_main():
    import ast, base64, builtins, io, json, linecache, resource, traceback

    request = json.loads(sys.stdin.buffer.read().decode("utf-8"))
    relay = open(request["relay_fd"], "wb", closefd=False)
    memory_record = b'{"kind":"memory_exhausted"}\n'
    capture = bool(request["capture_artifacts"])
    allowed = set(request["allowed_modules"])
    summary_limit = int(request["summary_limit"])
    real_import = builtins.__import__
    state = {"pyplot_patched": False}

    for stream in (sys.stdout, sys.stderr):
        try:
            stream.reconfigure(encoding="utf-8", errors="backslashreplace")
        except Exception:
            pass

    def send(record):
        relay.write(json.dumps(record).encode("utf-8") + b"\n")
        relay.flush()

    def describe(value):
        try:
            return str(value)
        except MemoryError:
            raise
        except BaseException:
            return "<unprintable %s object>" % type(value).__name__

    def format_traceback(exc):
        tb = exc.__traceback__
        while tb is not None and tb.tb_frame.f_code.co_filename != "<fragment>":
            tb = tb.tb_next
        try:
            if tb is None:
                return "".join(traceback.format_exception_only(type(exc), exc))
            summary = traceback.TracebackException(type(exc), exc, tb)
            pending, seen = [summary], set()
            while pending:
                current = pending.pop()
                if current is None or id(current) in seen:
                    continue
                seen.add(id(current))
                current.stack = traceback.StackSummary.from_list(
                    [frame for frame in current.stack if frame.filename != "<string>"]
                )
                pending.append(current.__cause__)
                pending.append(current.__context__)
            return "".join(summary.format())
        except MemoryError:
            raise
        except BaseException:
            return "%s: %s\n" % (type(exc).__name__, describe(exc))

    def module_allowed(name):
        if "*" in allowed:
            return True
        parts = name.split(".")
        return any(".".join(parts[:i]) in allowed for i in range(1, len(parts) + 1))

    def emit_artifact(data, mime_type="application/octet-stream"):
        if isinstance(data, str):
            data = data.encode("utf-8")
        data = bytes(data)
        if not capture:
            sys.stderr.write("emit_artifact: artifact capture is disabled, %d bytes dropped\n" % len(data))
            return
        send({
            "kind": "artifact",
            "mime_type": str(mime_type),
            "data": base64.b64encode(data).decode("ascii"),
        })

    def patch_pyplot(plt):
        state["pyplot_patched"] = True

        def show(*args, **kwargs):
            for number in plt.get_fignums():
                buffer = io.BytesIO()
                plt.figure(number).savefig(buffer, format="png")
                emit_artifact(buffer.getvalue(), "image/png")
            plt.close("all")

        plt.show = show

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        if level != 0 or not module_allowed(name):
            raise ImportError("import of %r is not permitted" % name)
        module = real_import(name, globals, locals, fromlist, level)
        if capture and not state["pyplot_patched"] and "matplotlib.pyplot" in sys.modules:
            patch_pyplot(sys.modules["matplotlib.pyplot"])
        return module

    safe = {}
    for name in request["builtins"]:
        if hasattr(builtins, name):
            safe[name] = getattr(builtins, name)
    safe["__import__"] = guarded_import

    namespace = {"__builtins__": safe, "__name__": "__main__", "__doc__": None}
    namespace.update(request["bindings"])
    namespace["emit_artifact"] = emit_artifact

    source = request["source"]
    linecache.cache["<fragment>"] = (len(source), None, source.splitlines(True), "<fragment>")
    exit_code = 0

    try:
        tree = ast.parse(source, "<fragment>", "exec")
        tail = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            tail = ast.Expression(tree.body.pop().value)
        exec(compile(tree, "<fragment>", "exec"), namespace)
        value = None
        if tail is not None:
            value = eval(compile(tail, "<fragment>", "eval"), namespace)
        summary = None
        if value is not None:
            summary = repr(value)
        elif "result" in namespace:
            summary = repr(namespace["result"])
        if summary is not None:
            send({"kind": "return", "summary": summary[:summary_limit]})
    except MemoryError:
        exit_code = 3
        try:
            relay.write(memory_record)
            relay.flush()
        except BaseException:
            pass
    except SystemExit as exc:
        if exc.code not in (None, 0):
            exit_code = 1
            send({"kind": "exception", "type": "SystemExit", "message": describe(exc.code), "traceback": ""})
    except BaseException as exc:
        exit_code = 1
        try:
            send({
                "kind": "exception",
                "type": type(exc).__name__,
                "message": describe(exc),
                "traceback": format_traceback(exc),
            })
        except MemoryError:
            exit_code = 3
            try:
                relay.write(memory_record)
                relay.flush()
            except BaseException:
                pass

    try:
        send({"kind": "stats", "peak_rss_kb": resource.getrusage(resource.RUSAGE_SELF).ru_maxrss})
    except BaseException:
        pass
    for stream in (sys.stdout, sys.stderr):
        try:
            stream.flush()
        except BaseException:
            pass
    os._exit(exit_code)


_fencebox_main()
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Policy;
    use crate::extract::Fragment;
    use crate::policy::PolicyCompiler;

    #[test]
    fn test_request_carries_namespace() {
        let fragment = Fragment {
            text: "print(n)".to_string(),
            source_span: (0, 8),
            language_tag: None,
            index: 0,
        };
        let policy = Policy::default().with_artifacts(true);
        let unit = PolicyCompiler::default().compile(&fragment, &policy).unwrap();
        let mut bindings = Map::new();
        bindings.insert("n".to_string(), Value::from(3));

        let request = WorkerRequest::new(&unit, &bindings, 128);
        let json: Value = serde_json::from_slice(&request.to_bytes().unwrap()).unwrap();

        assert_eq!(json["source"], "print(n)");
        assert_eq!(json["capture_artifacts"], true);
        assert_eq!(json["bindings"]["n"], 3);
        assert_eq!(json["relay_fd"], RELAY_FD);
        assert!(json["builtins"]
            .as_array()
            .unwrap()
            .iter()
            .any(|name| name == "print"));
    }

    #[test]
    fn test_bootstrap_exits_hard() {
        assert!(BOOTSTRAP.contains("os._exit(exit_code)"));
        assert!(BOOTSTRAP.contains("\"<fragment>\""));
    }
}
