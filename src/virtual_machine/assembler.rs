//! Assembly language parser and bytecode compiler.
//!
//! Converts human-readable assembly source into executable bytecode.
//! Uses [`for_each_instruction!`](crate::for_each_instruction) to generate:
//! - `AsmInstr`, the assembler's instruction representation
//! - `parse_instruction` for tokenized input parsing
//! - per-instruction bytecode emission
//!
//! # Syntax
//!
//! ```text
//! INSTRUCTION operand  # optional comment
//! ```
//!
//! - Instructions are uppercase (e.g., `PUSH`, `JUMP_IF_FALSE`)
//! - Values are decimal floats (e.g., `42`, `-0.3`)
//! - Indices, sizes, and jump offsets are decimal integers
//! - Jump operands may name a label (`loop:` defines, `loop` refers)
//! - Comments start with `#`
//! - Commas between operands are optional

use crate::define_instructions;
use crate::for_each_instruction;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::program::Program;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';

/// Formats a compiler-style diagnostic for assembly failures.
fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    offset: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Emit a helpful diagnostic to stderr for assembly errors.
fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    if let VMError::AssemblyError {
        line,
        offset,
        source: message,
    } = err
    {
        eprintln!(
            "{}",
            render_assembly_diagnostic(file, source, *line, *offset, message)
        );
    } else {
        eprintln!("error: {err}");
    }
}

/// Assembly context tracking label definitions during compilation.
struct AsmContext {
    /// Label definitions mapping names to bytecode offsets.
    labels: HashMap<String, usize>,
}

impl AsmContext {
    fn new() -> Self {
        Self {
            labels: HashMap::new(),
        }
    }

    /// Registers a label at the given bytecode offset.
    fn define_label(&mut self, name: String, offset: usize) -> Result<(), VMError> {
        if self.labels.contains_key(&name) {
            return Err(VMError::DuplicateLabel { label: name });
        }
        self.labels.insert(name, offset);
        Ok(())
    }

    /// Resolves a label to its bytecode offset.
    fn resolve_label(&self, name: &str) -> Result<usize, VMError> {
        self.labels
            .get(name)
            .copied()
            .ok_or(VMError::UndefinedLabel {
                label: name.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// `#` starts a comment, commas count as whitespace, everything else splits
/// on whitespace.
fn tokenize(line: &str) -> Vec<Token<'_>> {
    let mut out = Vec::with_capacity(4);
    let mut start: Option<usize> = None;

    for (i, b) in line.bytes().enumerate() {
        if b == COMMENT_CHAR as u8 {
            break;
        }
        match b {
            b',' | b' ' | b'\t' => {
                if let Some(s) = start.take() {
                    out.push(Token {
                        text: &line[s..i],
                        offset: s + 1,
                    });
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                }
            }
        }
    }

    if let Some(s) = start {
        let end = line.find(COMMENT_CHAR).unwrap_or(line.len());
        out.push(Token {
            text: &line[s..end],
            offset: s + 1,
        });
    }

    out
}

/// Parse an f64 literal.
fn parse_f64(tok: &str) -> Result<f64, VMError> {
    tok.parse::<f64>().map_err(|_| VMError::InvalidOperand {
        token: tok.to_string(),
    })
}

/// Parses an i32 immediate or a label reference.
///
/// If `tok` parses as an integer it is taken verbatim. Otherwise it is
/// resolved as a label name and turned into an offset relative to
/// `next_instruction_offset`, the position right after the operand, which is
/// where the VM applies jump offsets.
fn parse_i32_or_label(
    tok: &str,
    ctx: &AsmContext,
    next_instruction_offset: usize,
) -> Result<i32, VMError> {
    if let Ok(v) = tok.parse::<i32>() {
        return Ok(v);
    }
    let target = ctx.resolve_label(tok)?;
    Ok((target as i64 - next_instruction_offset as i64) as i32)
}

/// Checks if a token is a label definition (ends with `:`)
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

macro_rules! define_parse_instruction {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {

        // =========================
        // Assembler IR
        // =========================
        #[derive(Debug, Clone)]
        enum AsmInstr {
            $(
                $name {
                    $( $field: define_instructions!(@ty $kind) ),*
                },
            )*
        }

        impl AsmInstr {
            /// Encodes the assembly instruction into bytecode
            fn assemble(&self, out: &mut Vec<u8>) {
                match self {
                    $(
                        AsmInstr::$name { $( $field ),* } => {
                            out.push($opcode);
                            $(
                                define_instructions!(@emit out, $kind, $field);
                            )*
                        }
                    ),*
                }
            }
        }

        fn instruction_from_str(name: &str) -> Result<Instruction, VMError> {
            match name {
                $( $mnemonic => Ok(Instruction::$name), )*
                _ => Err(VMError::InvalidInstructionName {
                    name: name.to_string(),
                }),
            }
        }

        /// Returns the bytecode size for an instruction (opcode + operands).
        fn instruction_size(instr: Instruction) -> usize {
            match instr {
                $(
                    Instruction::$name => {
                        1usize $( + define_parse_instruction!(@size $kind) )*
                    }
                ),*
            }
        }

        /// Parse one instruction from tokens into [`AsmInstr`].
        ///
        /// `current_offset` is the bytecode offset where this instruction
        /// starts, used for resolving label references to relative offsets.
        fn parse_instruction(
            ctx: &AsmContext,
            tokens: &[Token],
            current_offset: usize,
        ) -> Result<AsmInstr, VMError> {
            if tokens.is_empty() {
                return Err(VMError::ArityMismatch {
                    instruction: "<missing opcode>",
                    expected: 1,
                    actual: 0,
                });
            }

            let instr = instruction_from_str(tokens[0].text)?;
            let offset = current_offset + instruction_size(instr);

            match instr {
                $(
                    Instruction::$name => {
                        const EXPECTED: usize = 1 + define_parse_instruction!(@count $( $field ),*);
                        if tokens.len() != EXPECTED {
                            return Err(VMError::ArityMismatch {
                                instruction: instr.mnemonic(),
                                expected: EXPECTED - 1,
                                actual: tokens.len() - 1,
                            });
                        }

                        define_parse_instruction!(
                            @construct ctx offset tokens; $name $( $field : $kind ),*
                        )
                    }
                ),*
            }
        }
    };

    // ---------- counting ----------
    (@count $( $x:ident ),* ) => {
        <[()]>::len(&[ $( define_parse_instruction!(@unit $x) ),* ])
    };

    (@unit $x:ident) => { () };

    // ---------- operand sizes ----------
    (@size ImmF64) => { 8usize };
    (@size ImmI32) => { 4usize };

    // ---------- parsing ----------
    (@construct $ctx:ident $offset:ident $tokens:ident; $name:ident) => {
        Ok(AsmInstr::$name { })
    };

    (@construct $ctx:ident $offset:ident $tokens:ident; $name:ident $( $field:ident : $kind:ident ),+ ) => {{
        let mut it = $tokens.iter().skip(1);
        Ok(AsmInstr::$name {
            $(
                $field: define_parse_instruction!(
                    @parse_operand $kind, it.next().unwrap(), $ctx, $offset
                )?,
            )*
        })
    }};

    (@parse_operand ImmF64, $tok:expr, $ctx:expr, $current_offset:expr) => {
        parse_f64($tok.text)
    };

    (@parse_operand ImmI32, $tok:expr, $ctx:expr, $current_offset:expr) => {
        parse_i32_or_label($tok.text, $ctx, $current_offset)
    };
}

for_each_instruction!(define_parse_instruction);

/// Performs two-pass assembly.
///
/// Pass 1 tokenizes all lines, computes instruction sizes, and records label
/// positions. Pass 2 parses instructions with label resolution and emits
/// bytecode.
fn assemble_lines(source: &str) -> Result<Program, VMError> {
    let mut ctx = AsmContext::new();

    // First pass: tokenize all lines, compute offsets, collect labels
    let mut parsed_lines: Vec<(usize, Vec<Token>)> = Vec::new();
    let mut size = 0usize;

    for (line_no, line) in source.lines().enumerate() {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            continue;
        }

        if is_label_def(tokens[0].text) {
            let name = label_name(tokens[0].text).to_string();
            ctx.define_label(name, size)
                .map_err(|e| VMError::AssemblyError {
                    line: line_no + 1,
                    offset: tokens[0].offset,
                    source: e.to_string(),
                })?;

            // Tokens after the label form an instruction on the same line.
            if tokens.len() > 1 {
                let instr_tokens: Vec<Token> = tokens[1..].to_vec();
                let instr = instruction_from_str(instr_tokens[0].text).map_err(|e| {
                    VMError::AssemblyError {
                        line: line_no + 1,
                        offset: instr_tokens[0].offset,
                        source: e.to_string(),
                    }
                })?;
                size += instruction_size(instr);
                parsed_lines.push((line_no, instr_tokens));
            }
        } else {
            let instr =
                instruction_from_str(tokens[0].text).map_err(|e| VMError::AssemblyError {
                    line: line_no + 1,
                    offset: tokens[0].offset,
                    source: e.to_string(),
                })?;
            size += instruction_size(instr);
            parsed_lines.push((line_no, tokens));
        }
    }

    // Second pass: parse instructions and emit bytecode
    let mut bytecode = Vec::with_capacity(size);
    for (line_no, tokens) in parsed_lines {
        let instr = parse_instruction(&ctx, &tokens, bytecode.len()).map_err(|e| {
            VMError::AssemblyError {
                line: line_no + 1,
                offset: tokens.first().map(|t| t.offset).unwrap_or(1),
                source: e.to_string(),
            }
        })?;
        instr.assemble(&mut bytecode);
    }

    Program::new(bytecode)
}

/// Assemble a full source string into a program.
///
/// Uses two-pass assembly:
/// 1. First pass: tokenize lines, record label positions
/// 2. Second pass: parse instructions with label resolution, emit bytecode
///
/// Jump operands written as labels become offsets relative to the position
/// right after the operand, so `JUMP next` immediately before `next:` is a
/// no-op jump.
pub fn assemble_source(source: impl Into<String>) -> Result<Program, VMError> {
    assemble_source_with_name(source.into(), "<source>")
}

/// Assembles source with an associated filename for error diagnostics.
///
/// Runs both assembly passes and logs a compiler-style diagnostic to stderr
/// on failure, including source location information.
fn assemble_source_with_name(source: String, source_name: &str) -> Result<Program, VMError> {
    let result = assemble_lines(&source);
    if let Err(err) = &result {
        log_assembly_error(source_name, &source, err);
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Program, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        path: path_ref.display().to_string(),
        source: e.to_string(),
    })?;
    assemble_source_with_name(source, &path_ref.display().to_string())
}
