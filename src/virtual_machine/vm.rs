//! Core virtual machine implementation.
//!
//! The VM executes bytecode using a stack architecture: every value is an
//! IEEE-754 double, instructions pop their inputs off the operand stack and
//! push their result back. Vector instructions move values into a separate
//! arena addressed through a descriptor table, and the whole vector state can
//! be written to and restored from a snapshot via the [`Host`].

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::Host;
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::program::Program;
use crate::virtual_machine::snapshot::{MAX_VECTORS, MEMORY_SIZE, MemoryImage, VectorSlot};
use crate::warn;

/// Maximum depth of the operand stack.
pub const STACK_SIZE: usize = 1024;
/// Number of global variable slots.
pub const GLOBAL_SIZE: usize = 256;
/// Tolerance used by EQ when comparing two values.
pub const EPSILON: f64 = 1e-9;

/// Operand stack with a fixed capacity.
///
/// Overflow and underflow never abort execution: an overflowing push drops
/// the value, an underflowing pop yields 0.0. Both are logged so misbehaving
/// programs stay diagnosable.
struct Stack {
    values: Vec<f64>,
}

impl Stack {
    fn new() -> Self {
        Self {
            values: Vec::with_capacity(STACK_SIZE),
        }
    }

    fn push_value(&mut self, value: f64) {
        if self.values.len() >= STACK_SIZE {
            warn!("stack overflow, value dropped");
            return;
        }
        self.values.push(value);
    }

    fn pop_value(&mut self) -> f64 {
        match self.values.pop() {
            Some(value) => value,
            None => {
                warn!("stack underflow, using 0");
                0.0
            }
        }
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Vector arena and descriptor table.
///
/// Vectors are allocated bump-style out of a fixed arena of cells and never
/// freed. Each descriptor records where a vector starts and how long it is;
/// the descriptor index is what programs pass around on the stack.
struct VectorHeap {
    memory: [f64; MEMORY_SIZE],
    slots: [VectorSlot; MAX_VECTORS],
    next_memory_address: i32,
    next_vector_index: i32,
}

impl VectorHeap {
    fn new() -> Self {
        Self {
            memory: [0.0; MEMORY_SIZE],
            slots: [VectorSlot::EMPTY; MAX_VECTORS],
            next_memory_address: 0,
            next_vector_index: 0,
        }
    }

    /// Free cells remaining in the arena.
    fn available(&self) -> usize {
        MEMORY_SIZE - self.next_memory_address as usize
    }

    fn is_table_full(&self) -> bool {
        self.next_vector_index as usize >= MAX_VECTORS
    }

    /// Claims `size` cells and the next descriptor slot, returning the base
    /// address and the new descriptor index. Capacity must have been checked
    /// by the caller.
    fn record(&mut self, size: i32) -> (usize, i32) {
        let address = self.next_memory_address;
        let index = self.next_vector_index;
        self.slots[index as usize] = VectorSlot { size, address };
        self.next_memory_address += size;
        self.next_vector_index += 1;
        (address as usize, index)
    }

    fn slot(&self, reference: i32) -> Result<VectorSlot, VMError> {
        if reference < 0 || reference >= self.next_vector_index {
            return Err(VMError::InvalidVectorRef { reference });
        }
        Ok(self.slots[reference as usize])
    }

    /// Returns the cells of a live vector. Live slots always lie inside the
    /// arena, both when recorded here and when restored from a validated
    /// snapshot.
    fn elements(&self, slot: VectorSlot) -> &[f64] {
        let start = slot.address as usize;
        &self.memory[start..start + slot.size as usize]
    }

    fn snapshot(&self) -> MemoryImage {
        MemoryImage {
            next_memory_address: self.next_memory_address,
            next_vector_index: self.next_vector_index,
            memory: self.memory,
            vectors: self.slots,
        }
    }

    fn restore(&mut self, image: &MemoryImage) {
        self.next_memory_address = image.next_memory_address;
        self.next_vector_index = image.next_vector_index;
        self.memory = image.memory;
        self.slots = image.vectors;
    }
}

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        host = $host:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => exec_vm!(@call $vm, $host, $handler, $args)
            ),*
        }
    }};

    // Handler that reaches the outside world (semicolon separator)
    (@call $vm:ident, $host:ident, $handler:ident,
        (host; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $vm, $kind)?; )*
        $vm.$handler($host, $( $field ),*)
    }};

    // Pure handler (no semicolon)
    (@call $vm:ident, $host:ident, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $vm, $kind)?; )*
        $vm.$handler($( $field ),*)
    }};

    // Decode an f64 immediate (little-endian, 8 bytes)
    (@read $vm:ident, ImmF64) => {{
        let bytes = $vm.read_exact(8)?;
        Ok::<f64, VMError>(f64::from_le_bytes(bytes.try_into().unwrap()))
    }};

    // Decode an i32 immediate (little-endian, 4 bytes)
    (@read $vm:ident, ImmI32) => {{
        let bytes = $vm.read_exact(4)?;
        Ok::<i32, VMError>(i32::from_le_bytes(bytes.try_into().unwrap()))
    }};
}

/// Bytecode virtual machine.
///
/// Executes compiled bytecode sequentially, reading instructions from the
/// instruction pointer until HALT, the end of the bytecode, or a fatal fault.
/// Recoverable faults (a failed INPUT, an empty-stack PRINT, a snapshot I/O
/// error) are logged and execution continues.
pub struct VM {
    /// Bytecode to execute.
    code: Vec<u8>,
    /// Instruction pointer (current position in bytecode).
    ip: usize,
    /// Set by HALT to stop the run loop.
    halted: bool,
    /// Operand stack.
    stack: Stack,
    /// Global variable slots, all starting at 0.0.
    globals: Vec<f64>,
    /// Vector arena and descriptor table.
    heap: VectorHeap,
}

impl VM {
    /// Creates a new VM instance for the given program.
    pub fn new(program: Program) -> Self {
        Self {
            code: program.bytecode,
            ip: 0,
            halted: false,
            stack: Stack::new(),
            globals: vec![0.0; GLOBAL_SIZE],
            heap: VectorHeap::new(),
        }
    }

    /// Executes the bytecode until completion or a fatal fault.
    ///
    /// Runs instructions sequentially until HALT is executed or the
    /// instruction pointer leaves the bytecode buffer. A jump past either end
    /// of the program therefore stops the run cleanly.
    pub fn run<H: Host>(&mut self, host: &mut H) -> Result<(), VMError> {
        self.ip = 0;
        self.halted = false;
        while !self.halted && self.ip < self.code.len() {
            let opcode_offset = self.ip;
            let opcode = self.code[opcode_offset];
            self.ip += 1;
            let instr = Instruction::try_from(opcode).map_err(|_| VMError::InvalidInstruction {
                opcode,
                offset: opcode_offset,
            })?;
            if let Err(err) = self.exec(instr, host) {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!("{err}");
            }
        }
        Ok(())
    }

    /// Reads exactly `count` bytes from the bytecode at the current IP.
    ///
    /// Advances the instruction pointer by `count` bytes.
    fn read_exact(&mut self, count: usize) -> Result<&[u8], VMError> {
        let start = self.ip;
        let end = self
            .ip
            .checked_add(count)
            .ok_or(VMError::InvalidIP { ip: self.ip })?;
        let available = self.code.len().saturating_sub(start);

        let slice = self
            .code
            .get(start..end)
            .ok_or(VMError::UnexpectedEndOfBytecode {
                ip: start,
                requested: count,
                available,
            })?;

        self.ip = end;
        Ok(slice)
    }

    /// Executes a single instruction.
    fn exec<H: Host>(&mut self, instruction: Instruction, host: &mut H) -> Result<(), VMError> {
        exec_vm! {
            vm = self,
            host = host,
            instr = instruction,
            {
                // Stack and arithmetic
                Push => op_push(value: ImmF64),
                Add => op_add(),
                Sub => op_sub(),
                Mul => op_mul(),
                Div => op_div(),
                Print => op_print(host;),
                // Global variables
                Store => op_store(index: ImmI32),
                Load => op_load(index: ImmI32),
                // Vectors
                Vector => op_vector(size: ImmI32),
                Dot => op_dot(),
                Relu => op_relu(),
                // Comparisons
                Gt => op_gt(),
                Lt => op_lt(),
                Eq => op_eq(),
                // Control flow
                JumpIfFalse => op_jump_if_false(offset: ImmI32),
                Jump => op_jump(offset: ImmI32),
                // External world
                Rand => op_rand(host;),
                Input => op_input(host;),
                SaveFile => op_save_file(host;),
                LoadFile => op_load_file(host;),
                Halt => op_halt(),
            }
        }
    }

    fn op_push(&mut self, value: f64) -> Result<(), VMError> {
        self.stack.push_value(value);
        Ok(())
    }

    fn op_add(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        self.stack.push_value(a + b);
        Ok(())
    }

    fn op_sub(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        self.stack.push_value(a - b);
        Ok(())
    }

    fn op_mul(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        self.stack.push_value(a * b);
        Ok(())
    }

    fn op_div(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        if b == 0.0 {
            return Err(VMError::DivisionByZero);
        }
        self.stack.push_value(a / b);
        Ok(())
    }

    fn op_print<H: Host>(&mut self, host: &mut H) -> Result<(), VMError> {
        if self.stack.is_empty() {
            return Err(VMError::NothingToPrint);
        }
        let value = self.stack.pop_value();
        host.emit(&format_value(value));
        Ok(())
    }

    fn op_store(&mut self, index: i32) -> Result<(), VMError> {
        if index < 0 || index >= GLOBAL_SIZE as i32 {
            return Err(VMError::InvalidVariableIndex { index });
        }
        self.globals[index as usize] = self.stack.pop_value();
        Ok(())
    }

    fn op_load(&mut self, index: i32) -> Result<(), VMError> {
        if index < 0 || index >= GLOBAL_SIZE as i32 {
            return Err(VMError::InvalidVariableIndex { index });
        }
        self.stack.push_value(self.globals[index as usize]);
        Ok(())
    }

    fn op_vector(&mut self, size: i32) -> Result<(), VMError> {
        if size <= 0 || size as usize > MEMORY_SIZE {
            return Err(VMError::InvalidVectorSize { size });
        }
        if size as usize > self.heap.available() {
            return Err(VMError::OutOfMemory {
                requested: size,
                available: self.heap.available(),
            });
        }
        if self.heap.is_table_full() {
            return Err(VMError::VectorTableFull);
        }
        if self.stack.len() < size as usize {
            return Err(VMError::StackExhausted {
                needed: size,
                available: self.stack.len(),
            });
        }

        let (address, index) = self.heap.record(size);
        // Pops run newest-first, so the earliest push lands at the lowest cell.
        for i in (0..size as usize).rev() {
            self.heap.memory[address + i] = self.stack.pop_value();
        }
        self.stack.push_value(index as f64);
        Ok(())
    }

    fn op_dot(&mut self) -> Result<(), VMError> {
        let second = self.stack.pop_value() as i32;
        let first = self.stack.pop_value() as i32;
        let a = self.heap.slot(first)?;
        let b = self.heap.slot(second)?;
        if a.size != b.size {
            return Err(VMError::VectorSizeMismatch {
                left: a.size,
                right: b.size,
            });
        }

        let sum: f64 = self
            .heap
            .elements(a)
            .iter()
            .zip(self.heap.elements(b))
            .map(|(x, y)| x * y)
            .sum();
        self.stack.push_value(sum);
        Ok(())
    }

    fn op_relu(&mut self) -> Result<(), VMError> {
        let value = self.stack.pop_value();
        self.stack.push_value(if value < 0.0 { 0.0 } else { value });
        Ok(())
    }

    fn op_gt(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        self.stack.push_value(if a > b { 1.0 } else { 0.0 });
        Ok(())
    }

    fn op_lt(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        self.stack.push_value(if a < b { 1.0 } else { 0.0 });
        Ok(())
    }

    fn op_eq(&mut self) -> Result<(), VMError> {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        // Two-sided so the result is false whenever either side is NaN.
        let equal = (a - b) < EPSILON && (b - a) < EPSILON;
        self.stack.push_value(if equal { 1.0 } else { 0.0 });
        Ok(())
    }

    fn op_jump_if_false(&mut self, offset: i32) -> Result<(), VMError> {
        let condition = self.stack.pop_value();
        if condition == 0.0 {
            self.ip = (self.ip as i64).wrapping_add(offset as i64) as usize;
        }
        Ok(())
    }

    fn op_jump(&mut self, offset: i32) -> Result<(), VMError> {
        self.ip = (self.ip as i64).wrapping_add(offset as i64) as usize;
        Ok(())
    }

    fn op_rand<H: Host>(&mut self, host: &mut H) -> Result<(), VMError> {
        let value = host.random();
        self.stack.push_value(value);
        Ok(())
    }

    fn op_input<H: Host>(&mut self, host: &mut H) -> Result<(), VMError> {
        match host.read_value() {
            Some(value) => {
                self.stack.push_value(value);
                Ok(())
            }
            None => {
                self.stack.push_value(0.0);
                Err(VMError::InputFailed)
            }
        }
    }

    fn op_save_file<H: Host>(&mut self, host: &mut H) -> Result<(), VMError> {
        let bytes = self.heap.snapshot().to_bytes();
        host.write_snapshot(&bytes)
            .map_err(|err| VMError::SnapshotWriteFailed {
                reason: err.to_string(),
            })
    }

    fn op_load_file<H: Host>(&mut self, host: &mut H) -> Result<(), VMError> {
        let bytes = host
            .read_snapshot()
            .map_err(|err| VMError::SnapshotReadFailed {
                reason: err.to_string(),
            })?;
        let image = MemoryImage::from_bytes(&bytes).map_err(|err| VMError::SnapshotReadFailed {
            reason: err.to_string(),
        })?;
        // Nothing is touched until the whole image has been validated.
        self.heap.restore(&image);
        Ok(())
    }

    fn op_halt(&mut self) -> Result<(), VMError> {
        self.halted = true;
        Ok(())
    }
}

/// Formats a value the way C's `printf("%.15g", ...)` would.
///
/// Fixed notation with up to 15 significant digits and trailing zeros
/// removed, switching to scientific notation for very large or very small
/// magnitudes.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        return String::from("nan");
    }
    if value.is_infinite() {
        return String::from(if value < 0.0 { "-inf" } else { "inf" });
    }
    if value == 0.0 {
        return String::from(if value.is_sign_negative() { "-0" } else { "0" });
    }

    let sci = format!("{:.14e}", value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exponent: i32 = match exponent.parse() {
        Ok(exponent) => exponent,
        Err(_) => return sci,
    };

    if exponent < -4 || exponent >= 15 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (15 - 1 - exponent).max(0) as usize;
        let fixed = format!("{:.*}", decimals, value);
        trim_fraction(&fixed).to_string()
    }
}

/// Strips trailing zeros, then a trailing dot, from a decimal literal.
fn trim_fraction(text: &str) -> &str {
    if !text.contains('.') {
        return text;
    }
    text.trim_end_matches('0').trim_end_matches('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::assembler::assemble_source;
    use crate::virtual_machine::host::tests::TestHost;
    use crate::virtual_machine::snapshot::SNAPSHOT_SIZE;

    fn run_vm(source: &str) -> (VM, TestHost) {
        let program = assemble_source(source).expect("assembly failed");
        let mut vm = VM::new(program);
        let mut host = TestHost::new();
        vm.run(&mut host).expect("vm run failed");
        (vm, host)
    }

    fn run_vm_with_host(source: &str, mut host: TestHost) -> (VM, TestHost) {
        let program = assemble_source(source).expect("assembly failed");
        let mut vm = VM::new(program);
        vm.run(&mut host).expect("vm run failed");
        (vm, host)
    }

    fn run_expect_err(source: &str) -> VMError {
        let program = assemble_source(source).expect("assembly failed");
        let mut vm = VM::new(program);
        vm.run(&mut TestHost::new()).expect_err("expected error")
    }

    fn top(vm: &VM) -> f64 {
        *vm.stack.values.last().expect("stack is empty")
    }

    // ==================== Stack and Arithmetic ====================

    #[test]
    fn push_then_add() {
        let (vm, _) = run_vm("PUSH 1.5\nPUSH 2.25\nADD");
        assert_eq!(top(&vm), 3.75);
        assert_eq!(vm.stack.len(), 1);
    }

    #[test]
    fn float_artifacts_are_preserved() {
        let (vm, _) = run_vm("PUSH 0.1\nPUSH 0.2\nADD");
        assert_eq!(top(&vm), 0.30000000000000004);
    }

    #[test]
    fn sub_uses_push_order() {
        let (vm, _) = run_vm("PUSH 10\nPUSH 4\nSUB");
        assert_eq!(top(&vm), 6.0);
    }

    #[test]
    fn mul_and_div() {
        let (vm, _) = run_vm("PUSH 2.5\nPUSH 4\nMUL");
        assert_eq!(top(&vm), 10.0);

        let (vm, _) = run_vm("PUSH 1\nPUSH 8\nDIV");
        assert_eq!(top(&vm), 0.125);
    }

    #[test]
    fn div_by_zero_is_fatal() {
        assert!(matches!(
            run_expect_err("PUSH 1\nPUSH 0\nDIV"),
            VMError::DivisionByZero
        ));
    }

    #[test]
    fn div_by_zero_stops_execution() {
        let program = assemble_source("PUSH 5\nPUSH 1\nPUSH 0\nDIV\nPRINT").expect("assembly failed");
        let mut vm = VM::new(program);
        let mut host = TestHost::new();
        assert!(vm.run(&mut host).is_err());
        assert!(host.output.is_empty());
    }

    #[test]
    fn arithmetic_underflow_uses_zeros() {
        let (vm, _) = run_vm("ADD");
        assert_eq!(vm.stack.len(), 1);
        assert_eq!(top(&vm), 0.0);
    }

    #[test]
    fn stack_overflow_drops_value() {
        let mut stack = Stack::new();
        for i in 0..STACK_SIZE {
            stack.push_value(i as f64);
        }
        stack.push_value(123.0);
        assert_eq!(stack.len(), STACK_SIZE);
        assert_eq!(*stack.values.last().unwrap(), (STACK_SIZE - 1) as f64);
    }

    #[test]
    fn stack_underflow_yields_zero() {
        let mut stack = Stack::new();
        assert_eq!(stack.pop_value(), 0.0);
        assert_eq!(stack.len(), 0);
    }

    // ==================== Printing ====================

    #[test]
    fn print_pops_and_emits() {
        let (vm, host) = run_vm("PUSH 42\nPRINT");
        assert_eq!(host.output, vec!["42"]);
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn print_rounds_float_artifacts_away() {
        let (_, host) = run_vm("PUSH 0.1\nPUSH 0.2\nADD\nPRINT");
        assert_eq!(host.output, vec!["0.3"]);
    }

    #[test]
    fn print_on_empty_stack_is_recoverable() {
        let (_, host) = run_vm("PRINT\nPUSH 1\nPRINT");
        assert_eq!(host.output, vec!["1"]);
    }

    #[test]
    fn format_value_matches_c_printf() {
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(-0.0), "-0");
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(-1.5), "-1.5");
        assert_eq!(format_value(0.1 + 0.2), "0.3");
        assert_eq!(format_value(0.0001234), "0.0001234");
        assert_eq!(format_value(0.00001), "1e-05");
        assert_eq!(format_value(1e15), "1e+15");
        assert_eq!(format_value(999999999999999.0), "999999999999999");
        assert_eq!(format_value(123456789012345678.0), "1.23456789012346e+17");
        assert_eq!(format_value(f64::NAN), "nan");
        assert_eq!(format_value(f64::INFINITY), "inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-inf");
    }

    // ==================== Global Variables ====================

    #[test]
    fn store_load_roundtrip() {
        let (vm, _) = run_vm("PUSH 3.5\nSTORE 7\nLOAD 7\nLOAD 7\nADD");
        assert_eq!(top(&vm), 7.0);
    }

    #[test]
    fn uninitialized_global_reads_zero() {
        let (vm, _) = run_vm("LOAD 200");
        assert_eq!(top(&vm), 0.0);
    }

    #[test]
    fn store_rejects_out_of_range_indices() {
        assert!(matches!(
            run_expect_err("PUSH 1\nSTORE 256"),
            VMError::InvalidVariableIndex { index: 256 }
        ));
        assert!(matches!(
            run_expect_err("PUSH 1\nSTORE -1"),
            VMError::InvalidVariableIndex { index: -1 }
        ));
        assert!(matches!(
            run_expect_err("LOAD 256"),
            VMError::InvalidVariableIndex { index: 256 }
        ));
    }

    #[test]
    fn store_validates_index_before_popping() {
        let program = assemble_source("PUSH 9\nSTORE 300").expect("assembly failed");
        let mut vm = VM::new(program);
        let err = vm.run(&mut TestHost::new()).expect_err("expected error");
        assert!(matches!(err, VMError::InvalidVariableIndex { index: 300 }));
        assert_eq!(top(&vm), 9.0);
    }

    // ==================== Vectors ====================

    #[test]
    fn vector_stores_values_in_push_order() {
        let (vm, _) = run_vm("PUSH 1\nPUSH 2\nPUSH 3\nVECTOR 3");
        assert_eq!(vm.heap.memory[0..3], [1.0, 2.0, 3.0]);
        assert_eq!(top(&vm), 0.0);
        assert_eq!(vm.heap.next_memory_address, 3);
        assert_eq!(vm.heap.next_vector_index, 1);
    }

    #[test]
    fn second_vector_gets_next_index_and_address() {
        let (vm, _) = run_vm("PUSH 1\nPUSH 2\nPUSH 3\nVECTOR 3\nPUSH 4\nPUSH 5\nVECTOR 2");
        assert_eq!(top(&vm), 1.0);
        assert_eq!(vm.heap.slots[1], VectorSlot { size: 2, address: 3 });
        assert_eq!(vm.heap.memory[3..5], [4.0, 5.0]);
    }

    #[test]
    fn vector_rejects_bad_sizes() {
        assert!(matches!(
            run_expect_err("VECTOR 0"),
            VMError::InvalidVectorSize { size: 0 }
        ));
        assert!(matches!(
            run_expect_err("VECTOR -2"),
            VMError::InvalidVectorSize { size: -2 }
        ));
        // Checked before stack depth, so no pushes are needed.
        assert!(matches!(
            run_expect_err("VECTOR 1025"),
            VMError::InvalidVectorSize { size: 1025 }
        ));
    }

    #[test]
    fn vector_arena_exhaustion() {
        let program = assemble_source("PUSH 1\nPUSH 2\nPUSH 3\nVECTOR 3").expect("assembly failed");
        let mut vm = VM::new(program);
        vm.heap.next_memory_address = (MEMORY_SIZE - 2) as i32;
        let err = vm.run(&mut TestHost::new()).expect_err("expected error");
        assert!(matches!(
            err,
            VMError::OutOfMemory {
                requested: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn vector_table_exhaustion() {
        let program = assemble_source("PUSH 1\nVECTOR 1").expect("assembly failed");
        let mut vm = VM::new(program);
        vm.heap.next_vector_index = MAX_VECTORS as i32;
        let err = vm.run(&mut TestHost::new()).expect_err("expected error");
        assert!(matches!(err, VMError::VectorTableFull));
    }

    #[test]
    fn vector_needs_enough_stacked_values() {
        assert!(matches!(
            run_expect_err("PUSH 1\nVECTOR 2"),
            VMError::StackExhausted {
                needed: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn dot_product_end_to_end() {
        let source = "PUSH 0.5\nPUSH -0.3\nPUSH 0.8\nVECTOR 3\n\
                      PUSH 1\nPUSH 2\nPUSH 0.5\nVECTOR 3\n\
                      DOT\nPRINT";
        let (vm, host) = run_vm(source);
        assert_eq!(host.output, vec!["0.3"]);
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn dot_rejects_size_mismatch() {
        let source = "PUSH 1\nPUSH 2\nPUSH 3\nVECTOR 3\nPUSH 4\nPUSH 5\nVECTOR 2\nDOT";
        assert!(matches!(
            run_expect_err(source),
            VMError::VectorSizeMismatch { left: 3, right: 2 }
        ));
    }

    #[test]
    fn dot_rejects_dead_references() {
        assert!(matches!(
            run_expect_err("PUSH 0\nPUSH 0\nDOT"),
            VMError::InvalidVectorRef { reference: 0 }
        ));
        assert!(matches!(
            run_expect_err("PUSH -1\nPUSH -1\nDOT"),
            VMError::InvalidVectorRef { reference: -1 }
        ));
    }

    #[test]
    fn dot_truncates_fractional_references() {
        // 7.9 names descriptor 7, which was never allocated.
        let source = "PUSH 1\nPUSH 2\nVECTOR 2\nPUSH 7.9\nDOT";
        assert!(matches!(
            run_expect_err(source),
            VMError::InvalidVectorRef { reference: 7 }
        ));
    }

    // ==================== Comparisons ====================

    #[test]
    fn relu_clamps_negatives() {
        let (vm, _) = run_vm("PUSH -3\nRELU");
        assert_eq!(top(&vm), 0.0);

        let (vm, _) = run_vm("PUSH 2.5\nRELU");
        assert_eq!(top(&vm), 2.5);
    }

    #[test]
    fn relu_keeps_negative_zero() {
        let (vm, _) = run_vm("PUSH -0.0\nRELU");
        assert_eq!(top(&vm), 0.0);
        assert!(top(&vm).is_sign_negative());
    }

    #[test]
    fn gt_and_lt_use_push_order() {
        let (vm, _) = run_vm("PUSH 3\nPUSH 2\nGT");
        assert_eq!(top(&vm), 1.0);

        let (vm, _) = run_vm("PUSH 3\nPUSH 2\nLT");
        assert_eq!(top(&vm), 0.0);

        let (vm, _) = run_vm("PUSH 2\nPUSH 3\nLT");
        assert_eq!(top(&vm), 1.0);
    }

    #[test]
    fn eq_compares_within_epsilon() {
        let (vm, _) = run_vm("PUSH 1\nPUSH 1.0000000001\nEQ");
        assert_eq!(top(&vm), 1.0);

        let (vm, _) = run_vm("PUSH 1\nPUSH 1.1\nEQ");
        assert_eq!(top(&vm), 0.0);

        let (vm, _) = run_vm("PUSH 0.5\nPUSH 0.5\nEQ");
        assert_eq!(top(&vm), 1.0);
    }

    #[test]
    fn eq_is_false_for_nan() {
        let program = Program::new(vec![Instruction::Eq as u8]).unwrap();
        let mut vm = VM::new(program);
        vm.stack.push_value(f64::NAN);
        vm.stack.push_value(f64::NAN);
        vm.run(&mut TestHost::new()).unwrap();
        assert_eq!(top(&vm), 0.0);
    }

    // ==================== Control Flow ====================

    #[test]
    fn jump_skips_instructions() {
        let (vm, _) = run_vm("PUSH 1\nJUMP done\nPUSH 99\ndone: HALT");
        assert_eq!(vm.stack.values, vec![1.0]);
    }

    #[test]
    fn jump_offset_zero_is_a_noop() {
        let (vm, _) = run_vm("JUMP 0\nPUSH 5");
        assert_eq!(vm.stack.values, vec![5.0]);
    }

    #[test]
    fn backward_jump_runs_a_loop() {
        let source = r#"
            PUSH 3
            STORE 0
            loop: LOAD 0
            JUMP_IF_FALSE end
            LOAD 0
            PUSH 1
            SUB
            STORE 0
            JUMP loop
            end: HALT
        "#;
        let (vm, _) = run_vm(source);
        assert_eq!(vm.globals[0], 0.0);
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn jump_if_false_pops_the_condition() {
        let (vm, _) = run_vm("PUSH 0\nJUMP_IF_FALSE skip\nPUSH 99\nskip: HALT");
        assert!(vm.stack.is_empty());

        let (vm, _) = run_vm("PUSH 1\nJUMP_IF_FALSE skip\nPUSH 42\nskip: HALT");
        assert_eq!(vm.stack.values, vec![42.0]);
    }

    #[test]
    fn jump_if_false_on_empty_stack_jumps() {
        // The underflow substitute 0.0 counts as false.
        let (vm, _) = run_vm("JUMP_IF_FALSE skip\nPUSH 99\nskip: HALT");
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn out_of_range_jumps_stop_cleanly() {
        let (vm, _) = run_vm("PUSH 1\nJUMP 5000");
        assert_eq!(vm.stack.values, vec![1.0]);

        let (vm, _) = run_vm("PUSH 1\nJUMP -5000");
        assert_eq!(vm.stack.values, vec![1.0]);
    }

    // ==================== External World ====================

    #[test]
    fn rand_pushes_host_randomness() {
        let mut host = TestHost::new();
        host.randoms.push_back(0.25);
        let (vm, _) = run_vm_with_host("RAND", host);
        assert_eq!(top(&vm), 0.25);
    }

    #[test]
    fn input_pushes_host_value() {
        let host = TestHost::with_inputs(vec![Some(4.5)]);
        let (vm, _) = run_vm_with_host("INPUT", host);
        assert_eq!(top(&vm), 4.5);
    }

    #[test]
    fn failed_input_pushes_zero_and_continues() {
        let host = TestHost::with_inputs(vec![None]);
        let (vm, _) = run_vm_with_host("INPUT\nPUSH 2\nADD", host);
        assert_eq!(top(&vm), 2.0);
    }

    #[test]
    fn halt_stops_execution() {
        let (vm, _) = run_vm("PUSH 1\nHALT\nPUSH 2");
        assert_eq!(vm.stack.values, vec![1.0]);
    }

    #[test]
    fn running_off_the_end_is_clean() {
        let (vm, _) = run_vm("PUSH 1");
        assert_eq!(vm.stack.values, vec![1.0]);
    }

    // ==================== Snapshots ====================

    #[test]
    fn save_and_load_roundtrip_through_host() {
        let save = "PUSH 0.5\nPUSH -0.3\nPUSH 0.8\nVECTOR 3\n\
                    PUSH 1\nPUSH 2\nPUSH 0.5\nVECTOR 3\nSAVE_FILE";
        let restore = "LOAD_FILE\nPUSH 0\nPUSH 1\nDOT\nPRINT";

        let (_, host) = run_vm(save);
        assert_eq!(host.snapshot.as_ref().map(Vec::len), Some(SNAPSHOT_SIZE));

        let (vm, host) = run_vm_with_host(restore, host);
        assert_eq!(host.output, vec!["0.3"]);
        assert_eq!(vm.heap.next_vector_index, 2);
    }

    #[test]
    fn failed_save_is_recoverable() {
        let mut host = TestHost::new();
        host.fail_snapshot_writes = true;
        let (vm, host) = run_vm_with_host("PUSH 1\nSAVE_FILE\nPUSH 2\nADD", host);
        assert_eq!(top(&vm), 3.0);
        assert!(host.snapshot.is_none());
    }

    #[test]
    fn missing_snapshot_is_recoverable() {
        let (vm, _) = run_vm("LOAD_FILE\nPUSH 7");
        assert_eq!(top(&vm), 7.0);
        assert_eq!(vm.heap.next_vector_index, 0);
    }

    #[test]
    fn corrupt_snapshot_leaves_state_untouched() {
        let mut host = TestHost::new();
        host.snapshot = Some(vec![1, 2, 3]);
        let (vm, _) = run_vm_with_host("PUSH 1\nPUSH 2\nVECTOR 2\nLOAD_FILE", host);
        assert_eq!(vm.heap.next_vector_index, 1);
        assert_eq!(vm.heap.memory[0..2], [1.0, 2.0]);
    }

    // ==================== Faults ====================

    #[test]
    fn invalid_opcode() {
        let mut vm = VM::new(Program::new(vec![0xFF]).unwrap());
        assert!(matches!(
            vm.run(&mut TestHost::new()),
            Err(VMError::InvalidInstruction {
                opcode: 0xFF,
                offset: 0
            })
        ));
    }

    #[test]
    fn invalid_opcode_reports_its_offset() {
        let mut vm = VM::new(Program::new(vec![Instruction::Add as u8, 0xFF]).unwrap());
        assert!(matches!(
            vm.run(&mut TestHost::new()),
            Err(VMError::InvalidInstruction {
                opcode: 0xFF,
                offset: 1
            })
        ));
    }

    #[test]
    fn truncated_push_operand() {
        let mut vm = VM::new(Program::new(vec![0x00, 0x01, 0x02]).unwrap());
        assert!(matches!(
            vm.run(&mut TestHost::new()),
            Err(VMError::UnexpectedEndOfBytecode {
                ip: 1,
                requested: 8,
                available: 2
            })
        ));
    }

    #[test]
    fn truncated_store_operand() {
        let mut vm = VM::new(Program::new(vec![Instruction::Store as u8]).unwrap());
        assert!(matches!(
            vm.run(&mut TestHost::new()),
            Err(VMError::UnexpectedEndOfBytecode {
                ip: 1,
                requested: 4,
                available: 0
            })
        ));
    }
}
