//! qbc-drv - Pipeline driver.
//!
//! Orchestrates lexer → parser → analyzer → emitter and runs the result
//! in-process. The pipeline short-circuits at the first phase that
//! reports errors; diagnostics are rendered with a source snippet at
//! the end of the run. `$INCLUDE` metacommands are resolved here: the
//! named file is read, lexed and parsed with its own file id, and its
//! statements are spliced at the directive position, so every later
//! phase stays file-agnostic.
//!
//! Exit codes follow the contract: 0 for a normal `END`, 1 when
//! diagnostics stop compilation, 2 on a runtime failure, 130 on
//! interruption. Ctrl-C is routed into the VM's cancellation token, so
//! an interrupted run closes its channels and unwinds instead of being
//! killed mid-instruction. Debug builds additionally verify every
//! emitted image's stack discipline and jump closure before it runs.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use qbc_emit::Image;
use qbc_par::{Stmt, StmtKind};
use qbc_util::{Diagnostic, Handler, SourceMap};
use qbc_vm::{CancelToken, RuntimeError, ScriptedHost, StdHost, Vm, VmFailure, VmState};
use tracing::debug;

pub const EXIT_OK: i32 = 0;
pub const EXIT_DIAGNOSTICS: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

const MAX_INCLUDE_DEPTH: usize = 16;

/// A successful compilation.
pub struct Compiled {
    pub image: Image,
    pub sources: SourceMap,
}

/// Compile a source buffer to an image, resolving includes relative to
/// `dir`. `None` means diagnostics were reported through `handler`.
pub fn compile(
    name: &str,
    source: &str,
    dir: Option<&Path>,
    handler: &Handler,
) -> Option<Compiled> {
    let mut sources = SourceMap::new();
    let file_id = sources.add_file(name, source);

    let tokens = qbc_lex::tokenize(source, file_id, handler);
    if handler.has_errors() {
        return None;
    }
    debug!(tokens = tokens.len(), "lexed");

    let mut program = qbc_par::parse(tokens, handler);
    if handler.has_errors() {
        return None;
    }
    debug!(statements = program.stmts.len(), "parsed");

    program.stmts = splice_includes(program.stmts, dir, &mut sources, handler, 0);
    if handler.has_errors() {
        return None;
    }

    let analysis = qbc_sem::analyze(&program, handler);
    if handler.has_errors() {
        return None;
    }
    debug!(
        globals = analysis.globals.len(),
        procs = analysis.procs.len(),
        "analyzed"
    );

    let image = qbc_emit::emit(&program, &analysis);
    debug!(instructions = image.code.len(), "emitted");

    // Debug builds verify every emitted image: consistent stack depth
    // at each pc, no underflow, every jump target inside the code. A
    // failure here is an emitter bug, never a user error.
    #[cfg(debug_assertions)]
    {
        if let Err(err) = qbc_emit::verify_image(&image) {
            panic!("emitted bytecode failed verification: {err}");
        }
    }

    Some(Compiled { image, sources })
}

/// Replace `$INCLUDE` statements with the parsed contents of the named
/// files.
fn splice_includes(
    stmts: Vec<Stmt>,
    dir: Option<&Path>,
    sources: &mut SourceMap,
    handler: &Handler,
    depth: usize,
) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        let StmtKind::Include(ref path) = stmt.kind else {
            out.push(stmt);
            continue;
        };
        if depth >= MAX_INCLUDE_DEPTH {
            handler.report(
                qbc_util::DiagnosticKind::UnexpectedToken,
                format!("$INCLUDE nesting too deep at `{path}`"),
                stmt.span,
            );
            continue;
        }
        let full_path = match dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        };
        let content = match fs::read_to_string(&full_path) {
            Ok(content) => content,
            Err(err) => {
                handler.report(
                    qbc_util::DiagnosticKind::UnexpectedToken,
                    format!("cannot read $INCLUDE file `{}`: {err}", full_path.display()),
                    stmt.span,
                );
                continue;
            }
        };
        let file_id = sources.add_file(full_path.display().to_string(), content.clone());
        let tokens = qbc_lex::tokenize(&content, file_id, handler);
        let included = qbc_par::parse(tokens, handler);
        let nested_dir = full_path.parent().map(Path::to_path_buf);
        let spliced = splice_includes(
            included.stmts,
            nested_dir.as_deref().or(dir),
            sources,
            handler,
            depth + 1,
        );
        out.extend(spliced);
    }
    out
}

/// Render collected diagnostics for the terminal.
pub fn render_diagnostics(diagnostics: &[Diagnostic], sources: &SourceMap) -> String {
    let mut out = String::new();
    for diag in diagnostics {
        let _ = writeln!(
            out,
            "{}[{}]: {}",
            diag.level, diag.kind, diag.message
        );
        let _ = writeln!(out, "  --> {}", sources.location(diag.span));
        if let Some(snippet) = sources.snippet(diag.span) {
            let _ = writeln!(out, "{snippet}");
        }
        for note in &diag.notes {
            let _ = writeln!(out, "  note: {note}");
        }
    }
    out
}

fn report(handler: &Handler, sources: Option<&SourceMap>) {
    let diagnostics = handler.take();
    if diagnostics.is_empty() {
        return;
    }
    match sources {
        Some(sources) => eprint!("{}", render_diagnostics(&diagnostics, sources)),
        None => {
            let empty = SourceMap::new();
            eprint!("{}", render_diagnostics(&diagnostics, &empty));
        }
    }
}

fn compile_file(path: &Path, handler: &Handler) -> anyhow::Result<Option<Compiled>> {
    let source = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read `{}`: {e}", path.display()))?;
    let dir = path.parent();
    Ok(compile(&path.display().to_string(), &source, dir, handler))
}

/// `check <file>`: diagnostics only.
pub fn check(path: &Path) -> anyhow::Result<i32> {
    let handler = Handler::new();
    match compile_file(path, &handler)? {
        Some(compiled) => {
            report(&handler, Some(&compiled.sources));
            Ok(EXIT_OK)
        }
        None => {
            report(&handler, None);
            Ok(EXIT_DIAGNOSTICS)
        }
    }
}

/// Route Ctrl-C into a cancellation token so the VM unwinds cleanly
/// and the process exits 130. The handler is installed once per
/// process; a second call keeps the first handler's token.
fn install_interrupt_handler(token: CancelToken) {
    let _ = ctrlc::set_handler(move || token.cancel());
}

/// `run <file>`: compile and execute in-process.
pub fn run(path: &Path) -> anyhow::Result<i32> {
    let handler = Handler::new();
    let Some(compiled) = compile_file(path, &handler)? else {
        report(&handler, None);
        return Ok(EXIT_DIAGNOSTICS);
    };
    report(&handler, Some(&compiled.sources));

    let mut host = StdHost::new();
    let mut vm = Vm::new(&compiled.image, &mut host);
    install_interrupt_handler(vm.cancel_token());
    match vm.run() {
        Ok(()) => Ok(EXIT_OK),
        Err(failure) => Ok(report_failure(&failure, &compiled)),
    }
}

fn report_failure(failure: &VmFailure, compiled: &Compiled) -> i32 {
    let location = compiled
        .image
        .span_at(failure.pc)
        .map(|entry| {
            let span = qbc_util::Span::with_file(
                entry.start as usize,
                entry.end as usize,
                qbc_util::FileId(entry.file),
                entry.line,
                entry.column,
            );
            compiled.sources.location(span)
        })
        .unwrap_or_else(|| "<unknown>".into());
    eprintln!("runtime error[{}]: {} at {location}", failure.error.name(), failure.error);
    if failure.error == RuntimeError::Interrupted {
        EXIT_INTERRUPTED
    } else {
        EXIT_RUNTIME
    }
}

/// `build <file> [-o out]`: write the bytecode image.
pub fn build(path: &Path, output: Option<&Path>) -> anyhow::Result<i32> {
    let handler = Handler::new();
    let Some(compiled) = compile_file(path, &handler)? else {
        report(&handler, None);
        return Ok(EXIT_DIAGNOSTICS);
    };
    report(&handler, Some(&compiled.sources));

    let out_path = match output {
        Some(p) => p.to_path_buf(),
        None => path.with_extension("qbx"),
    };
    let bytes = qbc_emit::write_image(&compiled.image);
    fs::write(&out_path, bytes)
        .map_err(|e| anyhow::anyhow!("cannot write `{}`: {e}", out_path.display()))?;
    println!("wrote {}", out_path.display());
    Ok(EXIT_OK)
}

/// `tokenize <file>`: stable textual token dump.
pub fn tokenize_dump(path: &Path) -> anyhow::Result<i32> {
    let source = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read `{}`: {e}", path.display()))?;
    let handler = Handler::new();
    let mut sources = SourceMap::new();
    let file_id = sources.add_file(path.display().to_string(), source.clone());
    let tokens = qbc_lex::tokenize(&source, file_id, &handler);
    for token in &tokens {
        let slice = source
            .get(token.span.start..token.span.end)
            .unwrap_or_default();
        println!(
            "{}:{}\t{:?}\t{:?}",
            token.span.line, token.span.column, token.kind, slice
        );
    }
    if handler.has_errors() {
        report(&handler, Some(&sources));
        return Ok(EXIT_DIAGNOSTICS);
    }
    Ok(EXIT_OK)
}

/// `parse <file>`: stable textual tree dump.
pub fn parse_dump(path: &Path) -> anyhow::Result<i32> {
    let source = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read `{}`: {e}", path.display()))?;
    let handler = Handler::new();
    let mut sources = SourceMap::new();
    let file_id = sources.add_file(path.display().to_string(), source.clone());
    let tokens = qbc_lex::tokenize(&source, file_id, &handler);
    let program = qbc_par::parse(tokens, &handler);
    if handler.has_errors() {
        report(&handler, Some(&sources));
        return Ok(EXIT_DIAGNOSTICS);
    }
    println!("{:#?}", program.stmts);
    Ok(EXIT_OK)
}

/// The interactive loop. Accumulates a module across entries,
/// recompiles the whole thing each time, and executes only the newly
/// appended statements against persistent variable state. Slot
/// identity holds because the emitter assigns slots in first-seen
/// order and the module only ever grows.
pub fn repl() -> anyhow::Result<i32> {
    let mut accumulated = String::new();
    let mut stmt_count = 0usize;
    let mut state = VmState::default();
    let stdin = std::io::stdin();

    // One token serves every entry; Ctrl-C interrupts the running
    // statement and the token is reset so the prompt stays usable.
    let interrupt = CancelToken::new();
    install_interrupt_handler(interrupt.clone());

    println!("qbc repl - empty line to exit");
    loop {
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let candidate = if accumulated.is_empty() {
            format!("{line}\n")
        } else {
            format!("{accumulated}{line}\n")
        };
        let handler = Handler::new();
        let Some(compiled) = compile("<repl>", &candidate, None, &handler) else {
            report(&handler, None);
            continue;
        };
        report(&handler, Some(&compiled.sources));
        accumulated = candidate;

        let total = compiled.image.stmt_pcs.len();
        if total > stmt_count {
            let entry_pc = compiled.image.stmt_pcs[stmt_count];
            let mut host = StdHost::new();
            let mut vm =
                Vm::new(&compiled.image, &mut host).with_cancel_token(interrupt.clone());
            vm.restore_state(std::mem::take(&mut state));
            if let Err(failure) = vm.run_from(entry_pc) {
                report_failure(&failure, &compiled);
                if failure.error == RuntimeError::Interrupted {
                    interrupt.reset();
                }
            }
            state = vm.take_state();
        }
        stmt_count = total;
    }
    Ok(EXIT_OK)
}

/// Compile and run a source string against a scripted host. Test and
/// embedding entry point; returns the output transcript.
pub fn run_scripted(source: &str, input: &[&str]) -> Result<String, String> {
    let handler = Handler::new();
    let Some(compiled) = compile("<memory>", source, None, &handler) else {
        return Err(render_diagnostics(&handler.take(), &SourceMap::new()));
    };
    let mut host = ScriptedHost::new(input);
    let mut vm = Vm::new(&compiled.image, &mut host);
    match vm.run() {
        Ok(()) => Ok(host.output_str()),
        Err(failure) => Err(failure.error.name().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_hello() {
        assert_eq!(run_scripted("PRINT \"Hello, World!\"\nEND", &[]).unwrap(), "Hello, World!\n");
    }

    #[test]
    fn test_pipeline_reports_diagnostics() {
        let err = run_scripted("PRINT )", &[]).unwrap_err();
        assert!(err.contains("UnexpectedToken"));
    }

    #[test]
    fn test_pipeline_runtime_failure_name() {
        let err = run_scripted("x = 1 \\ 0", &[]).unwrap_err();
        assert_eq!(err, "DivideByZero");
    }

    #[test]
    fn test_compile_produces_source_map_locations() {
        let handler = Handler::new();
        let compiled = compile("t.bas", "x = 1\ny = \"a\" + 1", None, &handler);
        assert!(compiled.is_none());
        let diagnostics = handler.take();
        assert!(!diagnostics.is_empty());
        assert_eq!(diagnostics[0].span.line, 2);
    }

    #[test]
    fn test_include_splicing() {
        let dir = std::env::temp_dir().join("qbc-include-test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("defs.bi"), "CONST Answer = 42\n").unwrap();

        let handler = Handler::new();
        let compiled = compile(
            "main.bas",
            "$INCLUDE:'defs.bi'\nPRINT Answer",
            Some(&dir),
            &handler,
        )
        .expect("compiles");
        assert!(!handler.has_errors());
        assert_eq!(compiled.sources.file_count(), 2);

        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&compiled.image, &mut host);
        vm.run().unwrap();
        assert_eq!(host.output_str(), " 42 \n");
    }

    #[test]
    fn test_missing_include_reports() {
        let handler = Handler::new();
        let compiled = compile("main.bas", "$INCLUDE:'nope.bi'", None, &handler);
        assert!(compiled.is_none());
    }

    #[test]
    fn test_repl_style_incremental_execution() {
        // The REPL contract, driven directly: state carries over and
        // only new statements run.
        let handler = Handler::new();
        let first = compile("<repl>", "x% = 41\n", None, &handler).unwrap();
        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&first.image, &mut host);
        vm.run().unwrap();
        let state = vm.take_state();
        assert_eq!(host.output_str(), "");

        let handler = Handler::new();
        let second = compile("<repl>", "x% = 41\nPRINT x% + 1\n", None, &handler).unwrap();
        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&second.image, &mut host);
        vm.restore_state(state);
        vm.run_from(second.image.stmt_pcs[1]).unwrap();
        assert_eq!(host.output_str(), " 42 \n");
    }

    #[test]
    fn test_build_image_round_trip() {
        let handler = Handler::new();
        let compiled = compile("t.bas", "PRINT 1 + 2", None, &handler).unwrap();
        let bytes = qbc_emit::write_image(&compiled.image);
        let back = qbc_emit::read_image(&bytes).unwrap();
        assert_eq!(back.code, compiled.image.code);
        assert_eq!(back.consts, compiled.image.consts);
    }
}
