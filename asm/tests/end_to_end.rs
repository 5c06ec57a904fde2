//! Black-box coverage of the assembler's documented invariants: bit-exact
//! encoding, disassemble(assemble(x)) idempotence, deferred-write order
//! independence, import determinism, scope isolation, and watch-mode
//! rebuild minimality.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use asm::disasm;
use asm::driver::{Driver, SourceReader};
use asm::error::{AsmError, AsmResult, ErrorPolicy};
use asm::watch::Coordinator;
use pretty_assertions::assert_eq;

#[derive(Default)]
struct FixtureReader {
    files: RefCell<HashMap<PathBuf, String>>,
}

impl FixtureReader {
    fn new(files: &[(&str, &str)]) -> Self {
        let map = files.iter().map(|(p, s)| (PathBuf::from(p), (*s).to_string())).collect();
        Self { files: RefCell::new(map) }
    }
}

impl SourceReader for FixtureReader {
    fn read_to_string(&self, path: &Path) -> AsmResult<String> {
        self.files.borrow().get(path).cloned().ok_or_else(|| AsmError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        })
    }

    fn read_bytes(&self, path: &Path) -> AsmResult<Vec<u8>> {
        self.read_to_string(path).map(String::into_bytes)
    }
}

fn assemble(src: &str) -> Vec<u8> {
    let reader = FixtureReader::new(&[("main.s", src)]);
    let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
    driver.assemble(Path::new("main.s")).unwrap()
}

#[test]
fn bit_exactness_matches_documented_instruction_forms() {
    assert_eq!(assemble(".arm\nbx r9\n"), vec![0x19, 0xff, 0x2f, 0xe1]);
    assert_eq!(assemble(".arm\nmov r3, #0x34000000\n"), vec![0x0d, 0x33, 0xa0, 0xe3]);
    assert_eq!(assemble(".thumb\nlsl r3, r5, #10\nlsl r3, r5\n"), vec![0xab, 0x02, 0xab, 0x40]);
}

#[test]
fn bit_exactness_resolves_a_forward_and_backward_branch_pair() {
    // `L1: b 0x08000008` branches two words ahead to `L2`; `L2: b L1`
    // branches back to the entry point.
    let bytes = assemble(".arm\nL1:\nb 0x08000008\nL2:\nb L1\n");
    assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0xea, 0xfd, 0xff, 0xff, 0xea]);
}

#[test]
fn bit_exactness_evaluates_nested_def_calls_at_assembly_time() {
    let bytes = assemble(".def add(a,b)=a+b\n.i8 add(1,2), add(add(1,1),1)\n");
    assert_eq!(bytes, vec![0x03, 0x03]);
}

#[test]
fn bit_exactness_resolves_labels_defined_after_their_use_in_a_def_call() {
    let bytes = assemble(".base 0\nzero:\n.i8 1\none:\n.i16 1\nthree:\n.def add(a,b)=a+b\n.i8 add(one, three)\n");
    assert_eq!(bytes, vec![0x01, 0x01, 0x00, 0x04]);
}

#[test]
fn idempotence_round_trips_arm_through_disassembly() {
    let bytes = assemble(".arm\nmov r0, #1\nadd r1, r0, r0\nbx lr\n");
    let lines = disasm::disassemble(&bytes, 0x0800_0000, false);
    let reassembled_src = format!(".arm\n{}\n", lines.iter().map(|l| l.text.clone()).collect::<Vec<_>>().join("\n"));
    assert_eq!(assemble(&reassembled_src), bytes);
}

#[test]
fn idempotence_round_trips_thumb_through_disassembly() {
    let bytes = assemble(".thumb\nmov r0, #1\nbx lr\n");
    let lines = disasm::disassemble(&bytes, 0x0800_0000, true);
    let reassembled_src = format!(".thumb\n{}\n", lines.iter().map(|l| l.text.clone()).collect::<Vec<_>>().join("\n"));
    assert_eq!(assemble(&reassembled_src), bytes);
}

#[test]
fn order_independence_of_multiple_simultaneously_pending_writes() {
    // A branch, a plain forward-referenced word, and a literal-pool load all
    // stay unresolved until the same later statement defines every label
    // they depend on; `finalise`'s fixed-point pass must settle all three to
    // the same bytes regardless of which one it happens to retry first.
    let bytes = assemble("b target\n.i32 target\nldr r0, =target\ntarget:\nbx lr\n");
    let branch = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let word = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let target_address = 0x0800_0000 + 4 + 4 + 4;
    assert_eq!(word, target_address);
    assert_eq!(branch & 0xFF00_0000, 0xEA00_0000);
}

#[test]
fn order_independence_of_multiple_interleaved_forward_references() {
    let bytes = assemble("b a\nb b\nb c\na:\nbx lr\nb:\nbx lr\nc:\nbx lr\n");
    // Three branches, each one word ahead of its target, resolving in a
    // single finalise pass regardless of which pending fixup is retried
    // first — every `b` here encodes the same one-word-ahead offset.
    let b = [0x01, 0x00, 0x00, 0xea];
    let bx_lr = [0x1e, 0xff, 0x2f, 0xe1];
    let expected: Vec<u8> = [b, b, b, bx_lr, bx_lr, bx_lr].concat();
    assert_eq!(bytes, expected);
}

#[test]
fn import_graph_resolution_is_independent_of_directive_order() {
    let a = {
        let reader = FixtureReader::new(&[
            ("main.s", ".import \"shared.s\"\nbx lr\n"),
            ("shared.s", "mov r0, #1\n"),
        ]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        driver.assemble(Path::new("main.s")).unwrap()
    };
    let b = {
        // Same two files, .import requested from a different statement
        // position relative to the rest of the body.
        let reader = FixtureReader::new(&[
            ("main.s", "bx lr\n.import \"shared.s\"\n"),
            ("shared.s", "mov r0, #1\n"),
        ]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        driver.assemble(Path::new("main.s")).unwrap()
    };
    assert_eq!(a, b);
}

#[test]
fn scope_isolation_hides_brace_scoped_constants_from_outside() {
    let reader = FixtureReader::new(&[("main.s", "{\n.def secret=7\n.i8 secret\n}\n.i8 secret\n")]);
    let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
    assert!(driver.assemble(Path::new("main.s")).is_err());
}

#[test]
fn scope_isolation_hides_brace_scoped_labels_from_outside() {
    let reader = FixtureReader::new(&[("main.s", "{\ninner:\nbx lr\n}\nb inner\n")]);
    let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
    assert!(driver.assemble(Path::new("main.s")).is_err());
}

#[test]
fn watch_minimality_skips_rebuild_for_files_outside_the_dependency_graph() {
    let reader = FixtureReader::new(&[("main.s", "mov r0, #1\nbx lr\n")]);
    let mut coordinator = Coordinator::new(&reader, PathBuf::from("main.s"), 0x0800_0000);
    coordinator.build();
    let affected = coordinator.affected_by(&[PathBuf::from("unrelated.s")]);
    assert!(affected.is_empty());
}

#[test]
fn watch_minimality_rebuilds_when_an_actually_read_file_changes() {
    let reader = FixtureReader::new(&[
        ("main.s", ".include \"sub.s\"\nbx lr\n"),
        ("sub.s", "mov r0, #1\n"),
    ]);
    let mut coordinator = Coordinator::new(&reader, PathBuf::from("main.s"), 0x0800_0000);
    coordinator.build();
    let affected = coordinator.affected_by(&[PathBuf::from("sub.s")]);
    assert!(affected.contains(&PathBuf::from("main.s")));
}

#[test]
fn reserved_identifiers_track_mode_base_and_position() {
    let bytes = assemble(".arm\n.i32 _here\n.i32 _pc\n");
    let here = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let pc = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    assert_eq!(here, 0x0800_0000);
    assert_eq!(pc, 0x0800_0004 + 8);
}

#[test]
fn begin_end_and_brace_scopes_nest_independently() {
    let bytes = assemble(".begin\n{\n.def x=1\n.i8 x\n}\n.end\nbx lr\n");
    assert_eq!(bytes.len(), 5);
}

#[test]
fn local_labels_are_namespaced_per_enclosing_global_label() {
    let bytes = assemble("a:\nb @@next\n@@next:\nbx lr\nc:\nb @@next\n@@next:\nbx lr\n");
    assert_eq!(bytes.len(), 16);
}

#[test]
fn anonymous_labels_resolve_by_nearest_run_in_each_direction() {
    let bytes = assemble("-\nbx lr\nb -\nb +\nbx lr\n+\nbx lr\n");
    assert_eq!(bytes.len(), 20);
}

#[test]
fn condition_before_flags_suffix_order_is_accepted() {
    assert_eq!(assemble(".arm\nmovsmi r0, #1\n"), assemble(".arm\nmovmis r0, #1\n"));
}

#[test]
fn dotted_condition_suffix_matches_concatenated_form() {
    assert_eq!(assemble(".arm\nbx.eq lr\n"), assemble(".arm\nbxeq lr\n"));
}

#[test]
fn numeric_literal_with_fraction_and_exponent_truncates_to_an_integer() {
    let bytes = assemble(".i8 1.5e2\n");
    assert_eq!(bytes, vec![150]);
}

#[test]
fn basic_string_literal_packs_characters_little_endian() {
    let bytes = assemble(".i32 'AB'\n");
    assert_eq!(bytes, vec![0x41, 0x42, 0x00, 0x00]);
}
