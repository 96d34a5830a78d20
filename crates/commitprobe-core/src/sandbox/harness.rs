//! Bundled Python test harness.
//!
//! Loads the test module, runs its `unittest` cases and bare `test_*`
//! functions, and records which lines of the target file executed. Exit
//! status: 0 all passed, 1 assertion failure, 2 any other error, 5 no tests.

use serde::Deserialize;

/// File name of the harness inside the sandbox.
pub const HARNESS_FILE: &str = ".commitprobe_harness.py";
/// File the harness writes executed lines to.
pub const COVERAGE_FILE: &str = ".commitprobe_coverage.json";

pub const PYTHON_HARNESS: &str = r#"import importlib.util
import inspect
import json
import os
import sys
import threading
import traceback
import unittest


def main():
    workdir, test_file, target_file, coverage_out = sys.argv[1:5]
    sys.path.insert(0, workdir)
    target = os.path.realpath(os.path.join(workdir, target_file))
    executed = set()
    known = {}

    def is_target(code):
        hit = known.get(code)
        if hit is None:
            hit = os.path.realpath(code.co_filename) == target
            known[code] = hit
        return hit

    def tracer(frame, event, arg):
        if not is_target(frame.f_code):
            return None
        if event == "line":
            executed.add(frame.f_lineno)
        return tracer

    status = 2
    sys.settrace(tracer)
    threading.settrace(tracer)
    try:
        path = os.path.join(workdir, test_file)
        spec = importlib.util.spec_from_file_location("commitprobe_generated_test", path)
        module = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(module)
        suite = unittest.defaultTestLoader.loadTestsFromModule(module)
        for name in sorted(vars(module)):
            obj = getattr(module, name)
            if name.startswith("test") and inspect.isfunction(obj):
                suite.addTest(unittest.FunctionTestCase(obj))
        result = unittest.TextTestRunner(stream=sys.stderr, verbosity=2).run(suite)
        if result.errors:
            status = 2
        elif result.failures:
            status = 1
        elif result.testsRun == 0:
            status = 5
        else:
            status = 0
    except BaseException:
        traceback.print_exc()
        status = 2
    finally:
        sys.settrace(None)
        threading.settrace(None)
        with open(coverage_out, "w") as fh:
            json.dump({"lines": sorted(executed)}, fh)
    sys.stdout.flush()
    sys.stderr.flush()
    sys.exit(status)


main()
"#;

#[derive(Debug, Deserialize)]
struct CoverageReport {
    lines: Vec<u32>,
}

/// Parse the harness coverage file.
pub fn parse_coverage(text: &str) -> Option<Vec<u32>> {
    serde_json::from_str::<CoverageReport>(text)
        .ok()
        .map(|report| report.lines)
}
