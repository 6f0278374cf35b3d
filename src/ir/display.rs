// Text printer for the IR. Values are renumbered in definition order (each block's
// parameters, then its instruction results) so printing a parsed module reproduces the
// input text exactly. The syntax is the one accepted by ir::parser.

use super::{Block, Function, GlobalData, InstKind, Linkage, Module, Terminator, Value};
use hashbrown::HashMap;
use std::fmt::{self, Write};

struct Names {
    map: HashMap<Value, usize>,
}

impl Names {
    fn for_function(func: &Function) -> Self {
        let mut map = HashMap::new();
        for block in &func.blocks {
            for &param in &block.params {
                let next = map.len();
                map.entry(param).or_insert(next);
            }
            for inst in &block.insts {
                if let Some(result) = inst.result {
                    let next = map.len();
                    map.entry(result).or_insert(next);
                }
            }
        }
        Self { map }
    }

    fn get(&self, v: Value) -> String {
        match self.map.get(&v) {
            Some(n) => format!("%{n}"),
            // Undefined values still print so broken IR can be inspected.
            None => format!("%undef.{}", v.0),
        }
    }

    fn list(&self, values: &[Value]) -> String {
        values
            .iter()
            .map(|v| self.get(*v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn write_escaped(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:02x}");
            }
        }
    }
    out.push('"');
}

impl fmt::Display for GlobalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global ")?;
        if self.linkage == Linkage::Internal {
            write!(f, "internal ")?;
        }
        if !self.writable {
            write!(f, "const ")?;
        }
        write!(f, "@{} = ", self.name)?;
        if let Ok(word) = <[u8; 8]>::try_from(self.bytes.as_slice()) {
            write!(f, "{}", i64::from_le_bytes(word))
        } else {
            let mut s = String::new();
            write_escaped(&mut s, &self.bytes);
            f.write_str(&s)
        }
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, func: &Function, block: &Block, names: &Names, is_entry: bool) -> fmt::Result {
    if is_entry || block.params.is_empty() {
        writeln!(f, "{}:", block.name)?;
    } else {
        writeln!(f, "{}({}):", block.name, names.list(&block.params))?;
    }
    for inst in &block.insts {
        write!(f, "    ")?;
        if let Some(result) = inst.result {
            write!(f, "{} = ", names.get(result))?;
        }
        match &inst.kind {
            InstKind::Iconst(v) => write!(f, "iconst {v}")?,
            InstKind::Binary(op, a, b) => {
                write!(f, "{} {}, {}", op.name(), names.get(*a), names.get(*b))?
            }
            InstKind::Icmp(cc, a, b) => {
                write!(f, "icmp {} {}, {}", cc.name(), names.get(*a), names.get(*b))?
            }
            InstKind::Call { callee, args } => write!(f, "call @{callee}({})", names.list(args))?,
            InstKind::SymbolAddr(sym) => write!(f, "addr @{sym}")?,
            InstKind::Load(addr) => write!(f, "load {}", names.get(*addr))?,
            InstKind::Store { addr, value } => {
                write!(f, "store {}, {}", names.get(*addr), names.get(*value))?
            }
        }
        writeln!(f)?;
    }
    let dest = |call: &super::BlockCall| {
        let label = &func.block(call.block).name;
        if call.args.is_empty() {
            label.clone()
        } else {
            format!("{label}({})", names.list(&call.args))
        }
    };
    match &block.terminator {
        Terminator::Unterminated => writeln!(f, "    ; missing terminator"),
        Terminator::Return(None) => writeln!(f, "    ret"),
        Terminator::Return(Some(v)) => writeln!(f, "    ret {}", names.get(*v)),
        Terminator::Jump(call) => writeln!(f, "    jmp {}", dest(call)),
        Terminator::Branch {
            cond,
            then_dest,
            else_dest,
        } => writeln!(
            f,
            "    br {}, {}, {}",
            names.get(*cond),
            dest(then_dest),
            dest(else_dest)
        ),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = Names::for_function(self);
        write!(f, "define ")?;
        if self.linkage == Linkage::Internal {
            write!(f, "internal ")?;
        }
        if !self.returns {
            write!(f, "void ")?;
        }
        writeln!(f, "@{}({}) {{", self.name, names.list(self.params()))?;
        for (idx, block) in self.blocks.iter().enumerate() {
            write_block(f, self, block, &names, idx == 0)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for global in &self.globals {
            writeln!(f, "{global}")?;
        }
        for (idx, func) in self.functions.iter().enumerate() {
            if idx > 0 || !self.globals.is_empty() {
                writeln!(f)?;
            }
            write!(f, "{func}")?;
        }
        Ok(())
    }
}
