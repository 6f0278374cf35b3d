// This module parses the textual IR format into a Module. Parsing happens in two steps:
// a recursive-descent pass over the characters builds a syntax tree that still refers to
// values and blocks by name, then a lowering pass allocates SSA values block by block
// (parameters first, then instruction results) and resolves every name. Resolving names
// after the whole function has been read allows forward references to blocks and to
// values defined in later blocks, which loops need. Errors carry the line and column of
// the offending token.

//! Text IR parser.

use super::{BinaryOp, BlockCall, BlockId, Function, Inst, InstKind, IntCC, Linkage, Module, Terminator, Value};
use crate::core::context::ThreadSafeContext;
use hashbrown::HashMap;
use thiserror::Error;

/// Syntax or name resolution error in IR text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a module from text, interning names in `context`.
pub fn parse_module(text: &str, name: &str, context: &ThreadSafeContext) -> ParseResult<Module> {
    let mut parser = Parser::new(text);
    let mut module = Module::new(name, context);
    parser.skip_whitespace();
    while !parser.is_eof() {
        let keyword = parser.read_identifier()?;
        match keyword.text {
            "global" => parser.parse_global(&mut module)?,
            "define" => {
                let func = parser.parse_function()?;
                let lowered = parser.lower_function(func, context)?;
                module.functions.push(lowered);
            }
            other => {
                return Err(parser.error_at(
                    keyword.pos,
                    format!("expected 'global' or 'define', found '{other}'"),
                ))
            }
        }
        parser.skip_whitespace();
    }
    log::trace!(
        "parsed module {name}: {} functions, {} globals",
        module.functions.len(),
        module.globals.len()
    );
    Ok(module)
}

#[derive(Debug, Clone, Copy)]
struct Name<'a> {
    text: &'a str,
    pos: usize,
}

struct CallAst<'a> {
    block: Name<'a>,
    args: Vec<Name<'a>>,
}

enum InstAst<'a> {
    Iconst(i64),
    Binary(BinaryOp, Name<'a>, Name<'a>),
    Icmp(IntCC, Name<'a>, Name<'a>),
    Call(&'a str, Vec<Name<'a>>),
    Addr(&'a str),
    Load(Name<'a>),
    Store(Name<'a>, Name<'a>),
}

enum TermAst<'a> {
    Ret(Option<Name<'a>>),
    Jmp(CallAst<'a>),
    Br(Name<'a>, CallAst<'a>, CallAst<'a>),
}

struct BlockAst<'a> {
    label: Name<'a>,
    params: Vec<Name<'a>>,
    insts: Vec<(Option<Name<'a>>, InstAst<'a>)>,
    term: TermAst<'a>,
}

struct FunctionAst<'a> {
    name: Name<'a>,
    linkage: Linkage,
    returns: bool,
    params: Vec<Name<'a>>,
    blocks: Vec<BlockAst<'a>>,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '$'
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn error_at(&self, pos: usize, message: String) -> ParseError {
        let before = &self.text[..pos.min(self.text.len())];
        let line = before.matches('\n').count() + 1;
        let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
        ParseError {
            line,
            column,
            message,
        }
    }

    fn error(&self, message: String) -> ParseError {
        self.error_at(self.pos, message)
    }

    fn found(&self) -> String {
        match self.current_char() {
            Some(ch) => format!("'{ch}'"),
            None => "end of input".to_string(),
        }
    }

    /// Skip whitespace and `;` comments, including newlines.
    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Skip spaces and tabs only, stopping at the end of the line.
    fn skip_inline_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> ParseResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!("expected '{ch}' but found {}", self.found())));
        }
        Ok(())
    }

    fn read_name_chars(&mut self) -> ParseResult<Name<'a>> {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if is_name_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error(format!("expected a name but found {}", self.found())));
        }
        Ok(Name {
            text: &self.text[start..self.pos],
            pos: start,
        })
    }

    fn read_identifier(&mut self) -> ParseResult<Name<'a>> {
        self.skip_whitespace();
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.read_name_chars(),
            _ => Err(self.error(format!("expected identifier but found {}", self.found()))),
        }
    }

    fn read_value_name(&mut self) -> ParseResult<Name<'a>> {
        self.expect('%')?;
        self.read_name_chars()
    }

    fn read_symbol(&mut self) -> ParseResult<&'a str> {
        self.expect('@')?;
        Ok(self.read_name_chars()?.text)
    }

    fn read_integer(&mut self) -> ParseResult<i64> {
        self.skip_whitespace();
        let start = self.pos;
        let negative = self.current_char() == Some('-');
        if negative {
            self.advance();
        }
        let digits_start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() {
                self.advance();
            } else {
                break;
            }
        }
        let digits = &self.text[digits_start..self.pos];
        let magnitude = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else {
            digits.parse::<u64>()
        }
        .map_err(|_| self.error_at(start, format!("invalid integer literal '{}'", &self.text[start..self.pos])))?;

        if negative {
            if magnitude > i64::MIN.unsigned_abs() {
                return Err(self.error_at(start, "integer literal out of range".to_string()));
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            // Hex literals may spell any 64-bit pattern.
            Ok(magnitude as i64)
        }
    }

    fn read_string(&mut self) -> ParseResult<Vec<u8>> {
        self.expect('"')?;
        let mut bytes = Vec::new();
        loop {
            let Some(ch) = self.current_char() else {
                return Err(self.error("unterminated string literal".to_string()));
            };
            self.advance();
            match ch {
                '"' => break,
                '\\' => {
                    let Some(esc) = self.current_char() else {
                        return Err(self.error("unterminated escape sequence".to_string()));
                    };
                    match esc {
                        '\\' | '"' => {
                            bytes.push(esc as u8);
                            self.advance();
                        }
                        'n' => {
                            bytes.push(b'\n');
                            self.advance();
                        }
                        't' => {
                            bytes.push(b'\t');
                            self.advance();
                        }
                        _ => {
                            let hex = self.text.get(self.pos..self.pos + 2).unwrap_or("");
                            let byte = u8::from_str_radix(hex, 16)
                                .map_err(|_| self.error(format!("invalid escape '\\{hex}'")))?;
                            bytes.push(byte);
                            self.pos += 2;
                        }
                    }
                }
                _ => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        Ok(bytes)
    }

    /// `global [internal] [const] @name = <integer | "string">`
    fn parse_global(&mut self, module: &mut Module) -> ParseResult<()> {
        let mut linkage = Linkage::Exported;
        let mut writable = true;
        loop {
            self.skip_whitespace();
            if self.current_char() == Some('@') {
                break;
            }
            let word = self.read_identifier()?;
            match word.text {
                "internal" => linkage = Linkage::Internal,
                "const" => writable = false,
                other => {
                    return Err(self.error_at(word.pos, format!("unknown global attribute '{other}'")))
                }
            }
        }
        let name = self.read_symbol()?;
        self.expect('=')?;
        self.skip_whitespace();
        let bytes = if self.current_char() == Some('"') {
            self.read_string()?
        } else {
            self.read_integer()?.to_le_bytes().to_vec()
        };
        module.add_global(name, linkage, bytes, writable);
        Ok(())
    }

    fn parse_value_list(&mut self) -> ParseResult<Vec<Name<'a>>> {
        let mut values = Vec::new();
        if self.try_read(')') {
            return Ok(values);
        }
        loop {
            values.push(self.read_value_name()?);
            if self.try_read(')') {
                return Ok(values);
            }
            self.expect(',')?;
        }
    }

    /// `define [internal] [void] @name(%a, ...) { blocks }`
    fn parse_function(&mut self) -> ParseResult<FunctionAst<'a>> {
        let mut linkage = Linkage::Exported;
        let mut returns = true;
        loop {
            self.skip_whitespace();
            if self.current_char() == Some('@') {
                break;
            }
            let word = self.read_identifier()?;
            match word.text {
                "internal" => linkage = Linkage::Internal,
                "void" => returns = false,
                other => {
                    return Err(self.error_at(word.pos, format!("unknown function attribute '{other}'")))
                }
            }
        }
        self.skip_whitespace();
        let name_pos = self.pos;
        let name = Name {
            text: self.read_symbol()?,
            pos: name_pos,
        };
        self.expect('(')?;
        let params = self.parse_value_list()?;
        self.expect('{')?;

        let mut blocks = Vec::new();
        loop {
            if self.try_read('}') {
                break;
            }
            blocks.push(self.parse_block(blocks.is_empty())?);
        }
        if blocks.is_empty() {
            return Err(self.error_at(name.pos, format!("function @{} has no blocks", name.text)));
        }
        Ok(FunctionAst {
            name,
            linkage,
            returns,
            params,
            blocks,
        })
    }

    /// Try to read `label:` or `label(%p, ...):`; restores the position if the
    /// upcoming text is not a label.
    fn try_parse_label(&mut self) -> ParseResult<Option<(Name<'a>, Vec<Name<'a>>)>> {
        self.skip_whitespace();
        let saved = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            _ => return Ok(None),
        }
        let label = self.read_name_chars()?;
        match self.current_char() {
            Some(':') => {
                self.advance();
                Ok(Some((label, Vec::new())))
            }
            Some('(') => {
                self.advance();
                let params = self.parse_value_list()?;
                self.expect(':')?;
                Ok(Some((label, params)))
            }
            _ => {
                self.pos = saved;
                Ok(None)
            }
        }
    }

    fn parse_block(&mut self, is_entry: bool) -> ParseResult<BlockAst<'a>> {
        let (label, params) = match self.try_parse_label()? {
            Some(label) => label,
            None if is_entry => (
                Name {
                    text: "entry",
                    pos: self.pos,
                },
                Vec::new(),
            ),
            None => return Err(self.error(format!("expected block label but found {}", self.found()))),
        };
        if is_entry && !params.is_empty() {
            return Err(self.error_at(
                label.pos,
                "entry block parameters are declared in the function signature".to_string(),
            ));
        }

        let mut insts = Vec::new();
        loop {
            self.skip_whitespace();
            if self.current_char() == Some('%') {
                let result = self.read_value_name()?;
                self.expect('=')?;
                let inst = self.parse_instruction()?;
                if matches!(inst, InstAst::Store(..)) {
                    return Err(self.error_at(result.pos, "store does not produce a value".to_string()));
                }
                insts.push((Some(result), inst));
                continue;
            }
            let word = self.read_identifier()?;
            match word.text {
                "ret" => {
                    self.skip_inline_whitespace();
                    let value = if self.current_char() == Some('%') {
                        Some(self.read_value_name()?)
                    } else {
                        None
                    };
                    return Ok(BlockAst {
                        label,
                        params,
                        insts,
                        term: TermAst::Ret(value),
                    });
                }
                "jmp" => {
                    let dest = self.parse_block_call()?;
                    return Ok(BlockAst {
                        label,
                        params,
                        insts,
                        term: TermAst::Jmp(dest),
                    });
                }
                "br" => {
                    let cond = self.read_value_name()?;
                    self.expect(',')?;
                    let then_dest = self.parse_block_call()?;
                    self.expect(',')?;
                    let else_dest = self.parse_block_call()?;
                    return Ok(BlockAst {
                        label,
                        params,
                        insts,
                        term: TermAst::Br(cond, then_dest, else_dest),
                    });
                }
                "store" | "call" => {
                    self.pos = word.pos;
                    let inst = self.parse_instruction()?;
                    insts.push((None, inst));
                }
                other => {
                    return Err(self.error_at(word.pos, format!("unexpected '{other}' in block {}", label.text)))
                }
            }
        }
    }

    fn parse_block_call(&mut self) -> ParseResult<CallAst<'a>> {
        let block = self.read_identifier()?;
        let args = if self.current_char() == Some('(') {
            self.advance();
            self.parse_value_list()?
        } else {
            Vec::new()
        };
        Ok(CallAst { block, args })
    }

    fn parse_instruction(&mut self) -> ParseResult<InstAst<'a>> {
        let op = self.read_identifier()?;
        if let Some(bin) = BinaryOp::from_name(op.text) {
            let lhs = self.read_value_name()?;
            self.expect(',')?;
            let rhs = self.read_value_name()?;
            return Ok(InstAst::Binary(bin, lhs, rhs));
        }
        match op.text {
            "iconst" => Ok(InstAst::Iconst(self.read_integer()?)),
            "icmp" => {
                let cc_name = self.read_identifier()?;
                let cc = IntCC::from_name(cc_name.text).ok_or_else(|| {
                    self.error_at(cc_name.pos, format!("unknown condition '{}'", cc_name.text))
                })?;
                let lhs = self.read_value_name()?;
                self.expect(',')?;
                let rhs = self.read_value_name()?;
                Ok(InstAst::Icmp(cc, lhs, rhs))
            }
            "call" => {
                let callee = self.read_symbol()?;
                self.expect('(')?;
                let args = self.parse_value_list()?;
                Ok(InstAst::Call(callee, args))
            }
            "addr" => Ok(InstAst::Addr(self.read_symbol()?)),
            "load" => Ok(InstAst::Load(self.read_value_name()?)),
            "store" => {
                let addr = self.read_value_name()?;
                self.expect(',')?;
                let value = self.read_value_name()?;
                Ok(InstAst::Store(addr, value))
            }
            other => Err(self.error_at(op.pos, format!("unknown instruction '{other}'"))),
        }
    }

    fn lower_function(&self, ast: FunctionAst<'a>, context: &ThreadSafeContext) -> ParseResult<Function> {
        let mut func = Function::new(
            context.intern(ast.name.text),
            ast.linkage,
            ast.params.len(),
            ast.returns,
        );
        func.blocks[0].name = ast.blocks[0].label.text.to_string();

        let mut labels: HashMap<&str, BlockId> = HashMap::new();
        let mut values: HashMap<&str, Value> = HashMap::new();
        let define = |name: Name<'a>, value: Value, values: &mut HashMap<&'a str, Value>| {
            if values.insert(name.text, value).is_some() {
                return Err(self.error_at(name.pos, format!("value %{} defined more than once", name.text)));
            }
            Ok(())
        };

        for (&param, name) in func.blocks[0].params.clone().iter().zip(&ast.params) {
            define(*name, param, &mut values)?;
        }

        // Allocate values in the same order the printer numbers them.
        let mut results: Vec<Vec<Option<Value>>> = Vec::with_capacity(ast.blocks.len());
        for (idx, block) in ast.blocks.iter().enumerate() {
            if labels.contains_key(block.label.text) {
                return Err(self.error_at(block.label.pos, format!("block {} defined more than once", block.label.text)));
            }
            let id = if idx == 0 {
                BlockId::ENTRY
            } else {
                func.create_block(block.label.text, block.params.len())
            };
            labels.insert(block.label.text, id);
            for (&param, name) in func.block(id).params.clone().iter().zip(&block.params) {
                define(*name, param, &mut values)?;
            }
            let mut block_results = Vec::with_capacity(block.insts.len());
            for (result, _) in &block.insts {
                match result {
                    Some(name) => {
                        let v = func.new_value();
                        define(*name, v, &mut values)?;
                        block_results.push(Some(v));
                    }
                    None => block_results.push(None),
                }
            }
            results.push(block_results);
        }

        let value = |name: &Name<'a>| {
            values
                .get(name.text)
                .copied()
                .ok_or_else(|| self.error_at(name.pos, format!("unknown value %{}", name.text)))
        };
        let value_list = |names: &[Name<'a>]| names.iter().map(value).collect::<ParseResult<Vec<_>>>();
        let block_call = |call: &CallAst<'a>| -> ParseResult<BlockCall> {
            let block = *labels
                .get(call.block.text)
                .ok_or_else(|| self.error_at(call.block.pos, format!("unknown block {}", call.block.text)))?;
            Ok(BlockCall {
                block,
                args: value_list(&call.args)?,
            })
        };

        for (idx, block) in ast.blocks.iter().enumerate() {
            let mut insts = Vec::with_capacity(block.insts.len());
            for ((_, inst), result) in block.insts.iter().zip(&results[idx]) {
                let kind = match inst {
                    InstAst::Iconst(v) => InstKind::Iconst(*v),
                    InstAst::Binary(op, a, b) => InstKind::Binary(*op, value(a)?, value(b)?),
                    InstAst::Icmp(cc, a, b) => InstKind::Icmp(*cc, value(a)?, value(b)?),
                    InstAst::Call(callee, args) => InstKind::Call {
                        callee: context.intern(callee),
                        args: value_list(args)?,
                    },
                    InstAst::Addr(sym) => InstKind::SymbolAddr(context.intern(sym)),
                    InstAst::Load(addr) => InstKind::Load(value(addr)?),
                    InstAst::Store(addr, v) => InstKind::Store {
                        addr: value(addr)?,
                        value: value(v)?,
                    },
                };
                insts.push(Inst {
                    result: *result,
                    kind,
                });
            }
            let terminator = match &block.term {
                TermAst::Ret(v) => Terminator::Return(v.as_ref().map(value).transpose()?),
                TermAst::Jmp(dest) => Terminator::Jump(block_call(dest)?),
                TermAst::Br(cond, then_dest, else_dest) => Terminator::Branch {
                    cond: value(cond)?,
                    then_dest: block_call(then_dest)?,
                    else_dest: block_call(else_dest)?,
                },
            };
            let target = &mut func.blocks[idx];
            target.insts = insts;
            target.terminator = terminator;
        }
        Ok(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
; two globals and two functions
global @counter = 0
global internal const @msg = "hi\00"

define @add(%a, %b) {
entry:
    %s = add %a, %b
    ret %s
}

define internal void @bump() {
entry:
    %p = addr @counter
    %v = load %p
    %one = iconst 1
    %n = add %v, %one
    store %p, %n
    ret
}
"#;

    #[test]
    fn test_parse_sample() {
        let ctx = ThreadSafeContext::new();
        let module = parse_module(SAMPLE, "sample", &ctx).unwrap();
        assert_eq!(module.globals.len(), 2);
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.globals[1].bytes, b"hi\0".to_vec());
        assert!(!module.globals[1].writable);
        let bump = module.function("bump").unwrap();
        assert_eq!(bump.linkage, Linkage::Internal);
        assert!(!bump.returns);
        assert!(matches!(bump.blocks[0].insts[4].kind, InstKind::Store { .. }));
        module.verify().unwrap();
    }

    #[test]
    fn test_round_trip_through_display() {
        let ctx = ThreadSafeContext::new();
        let src = r#"
define @loop(%n) {
entry:
    %z = iconst 0
    jmp head(%z, %z)
head(%i, %acc):
    %one = iconst 1
    %i2 = add %i, %one
    %acc2 = add %acc, %i2
    %done = icmp sge %i2, %n
    br %done, out(%acc2), head(%i2, %acc2)
out(%r):
    ret %r
}
"#;
        let first = parse_module(src, "m", &ctx).unwrap();
        let printed = first.to_string();
        let second = parse_module(&printed, "m", &ctx).unwrap();
        assert_eq!(printed, second.to_string());
        assert_eq!(first.functions, second.functions);
    }

    #[test]
    fn test_forward_value_reference() {
        let ctx = ThreadSafeContext::new();
        let src = "define @f() {\nentry:\n    jmp b\nc:\n    ret %x\nb:\n    %x = iconst 3\n    jmp c\n}\n";
        let module = parse_module(src, "m", &ctx).unwrap();
        module.verify().unwrap();
    }

    #[test]
    fn test_negative_and_hex_literals() {
        let ctx = ThreadSafeContext::new();
        let src = "global @a = -5\nglobal @b = 0xffffffffffffffff\n";
        let module = parse_module(src, "m", &ctx).unwrap();
        assert_eq!(module.globals[0].bytes, (-5i64).to_le_bytes().to_vec());
        assert_eq!(module.globals[1].bytes, (-1i64).to_le_bytes().to_vec());
    }

    #[test]
    fn test_error_reports_location() {
        let ctx = ThreadSafeContext::new();
        let src = "define @f() {\nentry:\n    %x = frobnicate %y\n}\n";
        let err = parse_module(src, "m", &ctx).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("frobnicate"));
    }

    #[test]
    fn test_unknown_value_is_rejected() {
        let ctx = ThreadSafeContext::new();
        let src = "define @f() {\nentry:\n    ret %nope\n}\n";
        let err = parse_module(src, "m", &ctx).unwrap_err();
        assert!(err.message.contains("unknown value"));
    }

    #[test]
    fn test_duplicate_label_is_rejected() {
        let ctx = ThreadSafeContext::new();
        let src = "define void @f() {\nentry:\n    jmp a\na:\n    jmp a\na:\n    ret\n}\n";
        assert!(parse_module(src, "m", &ctx).is_err());
    }
}
