use crate::bytecode::loader::{scan, DecodedOperand, Instruction};
use crate::bytecode::opcode::OpCode;

/// Print a disassembly of a bare instruction stream.
pub fn print_bc(code: &[u8]) {
    match disassemble(code) {
        Ok(listing) => print!("{}", listing),
        Err(e) => eprintln!("disassembly failed: {}", e),
    }
}

/// Render the instruction stream as text, marking jump targets.
pub fn disassemble(code: &[u8]) -> Result<String, String> {
    let instructions = scan(code).map_err(|e| e.to_string())?;
    let targets = collect_jump_targets(&instructions);

    let mut out = String::new();
    out.push_str("════════════════════════════════════════\n");
    out.push_str(&format!(" {} bytes, {} instructions\n", code.len(), instructions.len()));
    out.push_str("════════════════════════════════════════\n");

    for instr in &instructions {
        let marker = if targets.contains(&instr.offset) {
            "► "
        } else {
            "  "
        };
        out.push_str(&format!("{:04} {}{}", instr.offset, marker, render(instr)));
        out.push('\n');
    }
    Ok(out)
}

fn collect_jump_targets(instructions: &[Instruction]) -> Vec<usize> {
    let mut targets = Vec::new();
    for instr in instructions {
        let is_jump = matches!(
            instr.op,
            OpCode::Jmp
                | OpCode::Jz
                | OpCode::Jnz
                | OpCode::Jgt
                | OpCode::Jlt
                | OpCode::ForIter
                | OpCode::TryEnter
        );
        if !is_jump {
            continue;
        }
        if let DecodedOperand::I32(target) = instr.operand {
            let target = target as usize;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

fn render(instr: &Instruction) -> String {
    match &instr.operand {
        DecodedOperand::None => instr.op.name().to_string(),
        DecodedOperand::I32(v) => format!("{:<12}{}", instr.op.name(), v),
        DecodedOperand::Byte(b) => format!("{:<12}0x{:02X}", instr.op.name(), b),
        DecodedOperand::Name(n) => {
            if n.is_empty() {
                // Empty CALL operand: indirect through the stack.
                format!("{:<12}<indirect>", instr.op.name())
            } else {
                format!("{:<12}{:?}", instr.op.name(), n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_marks_jump_targets() {
        // JMP 6; HALT; (target) HALT
        let mut code = vec![0x0A];
        code.extend_from_slice(&6i32.to_be_bytes());
        code.push(0x00);
        code.push(0x00);

        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("JMP"));
        assert!(listing.contains("► HALT") || listing.contains("0006 ► HALT"));
    }

    #[test]
    fn test_disassemble_renders_operands() {
        let mut code = vec![0x01];
        code.extend_from_slice(&7i32.to_be_bytes());
        code.push(0x0C);
        code.push(0);
        code.push(0x00);

        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("PUSH_INT"));
        assert!(listing.contains('7'));
        assert!(listing.contains("<indirect>"));
    }
}
