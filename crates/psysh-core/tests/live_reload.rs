//! Integration tests for live reloading against a running session.
//!
//! Each test includes a real file into a [`Session`], rewrites it on disk
//! and checks what the next reload pass does to the running program.

use std::cell::RefCell;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use psysh_core::{ExecutionLoop, LiveReloader, Repl, Session, SignalHandler};
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    _temp_dir: TempDir,
    path: PathBuf,
    session: Session<Vec<u8>>,
    reloader: LiveReloader,
}

impl Fixture {
    /// Include `source` into a fresh session and take the first reload
    /// snapshot.
    fn new(source: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("lib.php");
        fs::write(&path, source).expect("Failed to write source file");
        // Included files are tracked by canonical path.
        let path = path.canonicalize().unwrap();

        let mut session =
            Session::new(Cursor::new(Vec::new()), Vec::new()).with_includes(vec![path.clone()]);
        session.load_includes().expect("include failed");

        let mut reloader = LiveReloader::new();
        assert!(reloader.reload(&mut session).is_empty());

        Self {
            _temp_dir: temp_dir,
            path,
            session,
            reloader,
        }
    }

    fn rewrite(&self, source: &str) {
        fs::write(&self.path, source).expect("Failed to rewrite source file");
        let file = fs::File::options().write(true).open(&self.path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
    }

    /// Evaluate `code` and return what it printed.
    fn eval(&mut self, code: &str) -> String {
        let before = self.session.output().len();
        self.session.execute(code).expect("evaluation failed");
        String::from_utf8_lossy(&self.session.output()[before..]).into_owned()
    }
}

// =============================================================================
// Reload behaviour
// =============================================================================

#[test]
fn test_function_body_is_replaced() {
    let mut fx = Fixture::new("<?php\nfunction greet($name) { return \"hello $name\"; }\n");
    assert_eq!(fx.eval("greet('ada')"), "=> \"hello ada\"\n");

    fx.rewrite("<?php\nfunction greet($name) { return \"goodbye $name\"; }\n");
    let summary = fx.reloader.reload(&mut fx.session);
    assert_eq!(summary.files.len(), 1);
    assert_eq!(summary.warnings().count(), 0);

    assert_eq!(fx.eval("greet('ada')"), "=> \"goodbye ada\"\n");
}

#[test]
fn test_unchanged_file_is_skipped() {
    let mut fx = Fixture::new("<?php\nfunction one() { return 1; }\n");
    fx.rewrite("<?php\nfunction one() { return 11; }\n");

    assert!(!fx.reloader.reload(&mut fx.session).is_empty());
    // Nothing moved since the last pass.
    assert!(fx.reloader.reload(&mut fx.session).is_empty());
    assert!(fx.reloader.reload(&mut fx.session).is_empty());
}

#[test]
fn test_conditional_definition_needs_force() {
    let mut fx = Fixture::new(
        "<?php\nif (!function_exists('helper')) {\n    function helper() { return 1; }\n}\n",
    );
    assert_eq!(fx.eval("helper()"), "=> 1\n");

    fx.rewrite(
        "<?php\nif (!function_exists('helper')) {\n    function helper() { return 2; }\n}\n",
    );
    let summary = fx.reloader.reload(&mut fx.session);
    let warnings: Vec<&str> = summary.warnings().collect();
    assert_eq!(
        warnings,
        vec!["Skipped conditional: if (...) { function helper() ... } (use `yolo` to force)"]
    );
    assert!(fx.reloader.ledger().is_skipped(&fx.path));
    assert_eq!(fx.eval("helper()"), "=> 1\n");

    let summary = fx.reloader.set_force_reload(true, &mut fx.session);
    assert_eq!(summary.files.len(), 1);
    assert!(!fx.reloader.ledger().is_skipped(&fx.path));
    fx.reloader.set_force_reload(false, &mut fx.session);

    assert_eq!(fx.eval("helper()"), "=> 2\n");

    // Forcing again has nothing left to do.
    assert!(fx.reloader.set_force_reload(true, &mut fx.session).is_empty());
}

#[test]
fn test_new_property_is_not_added() {
    let mut fx = Fixture::new(concat!(
        "<?php\nclass Counter {\n    public $count = 0;\n",
        "    public function next() { return $this->count + 1; }\n}\n",
    ));
    fx.eval("$c = new Counter();");

    fx.rewrite(concat!(
        "<?php\nclass Counter {\n    public $count = 0;\n    public $step = 2;\n",
        "    public function next() { return $this->count + 10; }\n}\n",
    ));
    let summary = fx.reloader.reload(&mut fx.session);
    let warnings: Vec<&str> = summary.warnings().collect();
    assert_eq!(warnings, vec!["Cannot add public $step"]);

    // The method body still changed.
    assert_eq!(fx.eval("$c->next()"), "=> 10\n");
    assert_eq!(fx.eval("property_exists($c, 'step')"), "=> false\n");
}

#[test]
fn test_syntax_error_keeps_old_definitions() {
    let mut fx = Fixture::new("<?php\nfunction stable() { return 'ok'; }\n");
    fx.rewrite("<?php\nfunction stable() { return 'broken' }\n");

    assert!(fx.reloader.reload(&mut fx.session).is_empty());
    let output = String::from_utf8_lossy(&fx.session.output()).into_owned();
    assert!(output.contains("has syntax errors and cannot be reloaded"), "{}", output);
    assert_eq!(fx.eval("stable()"), "=> \"ok\"\n");

    // Fixing the file gets picked up on the next pass.
    fx.rewrite("<?php\nfunction stable() { return 'fixed'; }\n");
    assert!(!fx.reloader.reload(&mut fx.session).is_empty());
    assert_eq!(fx.eval("stable()"), "=> \"fixed\"\n");
}

// =============================================================================
// Full loop
// =============================================================================

#[test]
fn test_execution_loop_with_reloader() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("math.php");
    fs::write(&path, "<?php\nfunction twice($n) { return $n * 2; }\n").unwrap();

    let input = "$x = twice(21);\nyolo echo $x;\nexit 6\n";
    let mut session = Session::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
        .with_includes(vec![path]);

    let reloader = Rc::new(RefCell::new(LiveReloader::new()));
    session.attach_reloader(Rc::clone(&reloader));

    let mut execution = ExecutionLoop::new();
    execution.add_listener(SignalHandler::new(session.interrupt_handle()));
    execution.add_listener(Rc::clone(&reloader));

    let code = execution.run(&mut session).unwrap();
    assert_eq!(code, 6);
    assert_eq!(String::from_utf8_lossy(&session.output()), "=> 42\n42");
    assert!(!reloader.borrow().is_force_reload());
}
