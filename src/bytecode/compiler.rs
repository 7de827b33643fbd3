use std::collections::HashMap;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::opcode::OpCode;
use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

/// Built-in type table entry: byte size plus field layout for the demo
/// composite types.
#[derive(Debug, Clone)]
struct TypeInfo {
    size: i32,
    fields: Vec<(&'static str, i32)>,
}

impl TypeInfo {
    fn scalar(size: i32) -> Self {
        TypeInfo {
            size,
            fields: Vec::new(),
        }
    }
}

/// Multi-word scalar type specifiers (`unsigned long`, `signed char`, ...).
const TYPE_SPEC: &[&str] = &[
    "unsigned", "signed", "long", "short", "char", "char8_t", "char16_t", "char32_t",
    "wchar_t", "int", "float", "double", "void", "bool", "_Bool",
];

/// Declaration modifiers that contribute no code and are consumed.
const DECL_MODIFIERS: &[&str] = &[
    "static", "extern", "public", "private", "async", "readonly", "sealed", "typedef",
    "alignas", "alignof", "asm", "auto", "const", "consteval", "constexpr", "constinit",
    "explicit", "export", "inline", "mutable", "register", "thread_local", "virtual",
    "volatile", "template", "typename", "concept", "requires", "noexcept", "friend",
    "restrict", "_Alignas", "_Alignof", "_Atomic", "_Bool", "_Complex", "_Generic",
    "_Imaginary", "_Noreturn", "_Static_assert", "_Thread_local", "typeof", "typeof_unqual",
];

/// Host functions lowered to syscalls by exact (possibly dotted) name.
/// Every lowered call pushes its argument count before the syscall byte.
const SYSCALL_FNS: &[(&str, u8)] = &[
    ("fopen", 0x70),
    ("open", 0x70),
    ("fprintf", 0x71),
    ("fclose", 0x72),
    ("printf", 0x60),
    ("print", 0x60),
    ("Console.WriteLine", 0x60),
    ("puts", 0x61),
    ("strlen", 0x62),
    ("len", 0x63),
    ("time", 0x80),
    ("time.time", 0x80),
    ("ctime", 0x81),
    ("math.sqrt", 0xB0),
    ("sqrt", 0xB0),
    ("abs", 0xB1),
    ("exit", 0xC0),
    ("sys.exit", 0xC0),
    ("system", 0xC1),
    ("os.system", 0xC1),
    ("sleep", 0xC2),
    ("time.sleep", 0xC2),
    ("reversed", 0xC9),
    ("__random", 0xCA),
    ("malloc", 0xD0),
    ("calloc", 0xD1),
    ("realloc", 0xD2),
    ("free", 0xD3),
    ("atof", 0xD4),
    ("atoi", 0xD5),
    ("atol", 0xD6),
    ("atoll", 0xD7),
    ("strtod", 0xD8),
    ("strtof", 0xD9),
    ("strtol", 0xDA),
    ("strtold", 0xDB),
    ("strtoll", 0xDC),
    ("strtoul", 0xDD),
    ("strtoull", 0xDE),
    ("abort", 0xE0),
    ("_Exit", 0xE1),
    ("atexit", 0xE2),
    ("at_quick_exit", 0xE3),
    ("quick_exit", 0xE4),
    ("getenv", 0xE5),
    ("bsearch", 0xE6),
    ("qsort", 0xE7),
    ("range", 0xE8),
    ("min", 0xE9),
    ("max", 0xEA),
    ("sum", 0xEB),
    ("sorted", 0xEC),
    ("int", 0xED),
    ("Integer", 0xED),
    ("float", 0xEE),
    ("Double", 0xEE),
    ("str", 0xEF),
    ("String", 0xEF),
    ("bool", 0xF0),
    ("tuple", 0xF1),
    ("chr", 0xF2),
    ("ord", 0xF3),
    ("round", 0xF4),
    ("divmod", 0xF5),
    ("pow", 0xF6),
    ("all", 0xF7),
    ("any", 0xF8),
    ("repr", 0xF9),
    ("bin", 0xFA),
    ("hex", 0xFB),
    ("oct", 0xFC),
    ("input", 0xFD),
    ("zip", 0xFE),
    ("enumerate", 0xFF),
    ("set", 0x90),
    ("dict", 0x92),
    ("list", 0x95),
    ("deque", 0x95),
];

/// Method calls lowered by dotted-name suffix. The receiver is loaded by
/// its remaining name, then count, then the syscall.
const METHOD_SUFFIXES: &[(&str, u8)] = &[
    (".assign", 0xA8),
    (".front", 0xA9),
    (".back", 0xAA),
    (".cbegin", 0xAB),
    (".begin", 0xAB),
    (".cend", 0xAC),
    (".end", 0xAC),
    (".crbegin", 0xAD),
    (".rbegin", 0xAD),
    (".crend", 0xAE),
    (".rend", 0xAE),
    (".size", 0x63),
    (".cardinality", 0x63),
    (".empty", 0xAF),
    (".max_size", 0xB4),
    (".clear", 0xB5),
    (".insert", 0xB6),
    (".emplace", 0xB6),
    (".erase", 0xB7),
    (".emplace_front", 0xB8),
    (".push_front", 0xB8),
    (".prepend_range", 0xB9),
    (".pop_front", 0x97),
    (".emplace_back", 0x96),
    (".push_back", 0x96),
    (".append_range", 0xBA),
    (".pop_back", 0x98),
    (".resize", 0xBB),
    (".swap", 0xBC),
    (".sort", 0xBD),
    (".unique", 0xBE),
    (".reverse", 0xBF),
    (".merge", 0xC3),
    (".splice", 0xC4),
    (".remove_if", 0xC6),
    (".remove", 0xC5),
    (".equals", 0xC7),
    (".compare", 0xC8),
    (".lower", 0xA0),
    (".upper", 0xA1),
    (".split", 0xA2),
    (".join", 0xA3),
    (".replace", 0xA4),
    (".find", 0xA5),
    (".startswith", 0xA6),
    (".strip", 0xA7),
    (".add", 0x91),
    (".push", 0x96),
    (".pop", 0x98),
    (".get", 0x94),
];

/// Single-pass code generator.
///
/// Tokens are walked left to right and bytecode is emitted directly; there
/// is no AST. Forward jumps are emitted with a zero operand and patched
/// once the target offset is known. Adjacent integer pushes followed by an
/// integer-algebra opcode are folded into one push.
pub struct Compiler {
    tokens: Vec<Spanned>,
    pos: usize,
    out: Vec<u8>,

    /// Function name -> body entry offset.
    symbols: HashMap<String, usize>,

    /// Built-in type table (sizes, composite field layouts).
    types: HashMap<&'static str, TypeInfo>,

    /// e.g. "random." while compiling an inlined imported body.
    module_prefix: String,

    /// Byte offsets of emitted instruction starts, for the peephole fold.
    instr_offsets: Vec<usize>,
}

impl Compiler {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        let mut types = HashMap::new();
        types.insert("int", TypeInfo::scalar(4));
        types.insert("char", TypeInfo::scalar(1));
        types.insert("void", TypeInfo::scalar(0));
        types.insert("FILE", TypeInfo::scalar(4));
        types.insert("size_t", TypeInfo::scalar(4));
        types.insert("string", TypeInfo::scalar(4));
        types.insert("var", TypeInfo::scalar(0));
        types.insert("bool", TypeInfo::scalar(1));
        types.insert("_Bool", TypeInfo::scalar(1));
        types.insert("double", TypeInfo::scalar(8));
        types.insert("float", TypeInfo::scalar(4));
        types.insert("time_t", TypeInfo::scalar(4));
        types.insert("short", TypeInfo::scalar(2));
        types.insert("long", TypeInfo::scalar(4));
        types.insert("signed", TypeInfo::scalar(4));
        types.insert("unsigned", TypeInfo::scalar(4));
        types.insert("wchar_t", TypeInfo::scalar(2));
        types.insert("char8_t", TypeInfo::scalar(1));
        types.insert("char16_t", TypeInfo::scalar(2));
        types.insert("char32_t", TypeInfo::scalar(4));
        types.insert("Color", TypeInfo::scalar(4));
        types.insert(
            "Point",
            TypeInfo {
                size: 8,
                fields: vec![("x", 0), ("y", 4)],
            },
        );
        types.insert(
            "IntFloat",
            TypeInfo {
                size: 4,
                fields: vec![("i", 0), ("f", 0)],
            },
        );
        // Collection pseudo-types (pointer-sized handles)
        for name in ["set", "dict", "deque", "queue", "heap", "tuple"] {
            types.insert(name, TypeInfo::scalar(4));
        }

        Compiler {
            tokens,
            pos: 0,
            out: Vec::new(),
            symbols: HashMap::new(),
            types,
            module_prefix: String::new(),
            instr_offsets: Vec::new(),
        }
    }

    pub fn compile(mut self) -> Result<Vec<u8>, CompileError> {
        while !matches!(self.cur(), Token::Eof) {
            self.parse_top_level()?;
        }

        let entry = if self.symbols.contains_key("main") {
            Some("main")
        } else if self.symbols.contains_key("Main") {
            Some("Main")
        } else {
            None
        };
        if let Some(entry) = entry {
            let entry = entry.to_string();
            self.emit_op(OpCode::Call);
            self.emit_name(&entry)?;
        }
        self.emit_op(OpCode::Halt);
        Ok(self.out)
    }

    // ── Token helpers ────────────────────────────────────────────────

    fn cur(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos + 1)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn cur_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.span.line)
            .unwrap_or_else(|| self.tokens.last().map(|s| s.span.line).unwrap_or(1))
    }

    fn bump(&mut self) -> Token {
        let token = self.cur().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.cur() == token {
            self.bump();
            true
        } else {
            false
        }
    }

    fn cur_word(&self) -> Option<&str> {
        self.cur().word()
    }

    /// Consumes an identifier or keyword and returns its text.
    fn expect_word(&mut self, context: &str) -> Result<String, CompileError> {
        match self.bump() {
            Token::Ident(w) | Token::Keyword(w) => Ok(w),
            other => Err(CompileError::unexpected(other, self.cur_line(), context)),
        }
    }

    fn mangle(&self, name: &str) -> String {
        if self.module_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}{}", self.module_prefix, name)
        }
    }

    // ── Emission helpers ─────────────────────────────────────────────

    fn emit_op(&mut self, op: OpCode) {
        self.instr_offsets.push(self.out.len());
        self.out.push(op as u8);
    }

    fn emit_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_push_int(&mut self, value: i32) {
        self.emit_op(OpCode::PushInt);
        self.emit_i32(value);
    }

    /// Emits a name operand (1-byte length prefix). Identifiers longer
    /// than 255 bytes cannot be encoded.
    fn emit_name(&mut self, name: &str) -> Result<(), CompileError> {
        let bytes = name.as_bytes();
        if bytes.len() > 255 {
            return Err(CompileError::encoding(format!(
                "name '{}…' exceeds 255 bytes",
                &name[..16.min(name.len())]
            )));
        }
        self.out.push(bytes.len() as u8);
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    /// The dedicated string-literal emitter. Long literals are split into
    /// <=255-byte chunks glued back together with ADD at runtime.
    fn emit_string_literal(&mut self, s: &str) {
        if s.len() <= 255 {
            self.emit_op(OpCode::PushStr);
            self.out.push(s.len() as u8);
            self.out.extend_from_slice(s.as_bytes());
            return;
        }

        let mut first = true;
        let mut chunk = String::new();
        for ch in s.chars() {
            if chunk.len() + ch.len_utf8() > 255 {
                self.emit_chunk(&chunk, &mut first);
                chunk.clear();
            }
            chunk.push(ch);
        }
        if !chunk.is_empty() {
            self.emit_chunk(&chunk, &mut first);
        }
    }

    fn emit_chunk(&mut self, chunk: &str, first: &mut bool) {
        self.emit_op(OpCode::PushStr);
        self.out.push(chunk.len() as u8);
        self.out.extend_from_slice(chunk.as_bytes());
        if *first {
            *first = false;
        } else {
            self.emit_op(OpCode::Add);
        }
    }

    fn emit_syscall(&mut self, id: u8) {
        self.emit_op(OpCode::Syscall);
        self.out.push(id);
    }

    /// Emits a jump with a zero target and returns the operand offset for
    /// later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let at = self.out.len();
        self.emit_i32(0);
        at
    }

    fn patch_i32(&mut self, at: usize, value: i32) {
        self.out[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn patch_here(&mut self, at: usize) {
        let here = self.out.len() as i32;
        self.patch_i32(at, here);
    }

    /// Peephole constant folding: if the two most recently emitted
    /// instructions are both PUSH_INT, replace them and the binary opcode
    /// `op` with a single PUSH_INT of the computed value. Division and
    /// modulo by zero keep the opcode so the runtime path can signal.
    fn try_fold(&mut self, op: OpCode) -> bool {
        let n = self.instr_offsets.len();
        if n < 2 {
            return false;
        }
        let a_off = self.instr_offsets[n - 2];
        let b_off = self.instr_offsets[n - 1];
        if b_off != a_off + 5
            || self.out.get(a_off) != Some(&(OpCode::PushInt as u8))
            || self.out.get(b_off) != Some(&(OpCode::PushInt as u8))
        {
            return false;
        }

        let a = read_i32(&self.out, a_off + 1);
        let b = read_i32(&self.out, b_off + 1);
        let folded = match op {
            OpCode::Add => a.wrapping_add(b),
            OpCode::Sub => a.wrapping_sub(b),
            OpCode::Mul => a.wrapping_mul(b),
            OpCode::Div if b != 0 => a.wrapping_div(b),
            OpCode::Mod if b != 0 => a.wrapping_rem(b),
            OpCode::Shl => a.wrapping_shl(b as u32),
            OpCode::Shr => a.wrapping_shr(b as u32),
            OpCode::BitAnd => a & b,
            OpCode::BitOr => a | b,
            OpCode::BitXor => a ^ b,
            _ => return false,
        };

        log::debug!("fold: {} {} {:?} -> {}", a, b, op, folded);
        self.out.truncate(a_off);
        self.instr_offsets.truncate(n - 2);
        self.emit_push_int(folded);
        true
    }

    // ── Top level ────────────────────────────────────────────────────

    fn parse_top_level(&mut self) -> Result<(), CompileError> {
        match self.cur() {
            Token::Eof => return Ok(()),
            Token::Indent(_) | Token::Dedent | Token::Semicolon => {
                self.bump();
                return Ok(());
            }
            _ => {}
        }

        if self.cur().is_kw("__module__") {
            self.bump();
            if let Some(word) = self.cur_word() {
                self.module_prefix = format!("{}.", word);
                self.bump();
            }
            return Ok(());
        }
        if self.cur().is_kw("__endmodule__") {
            self.bump();
            self.module_prefix.clear();
            self.eat(&Token::Semicolon);
            return Ok(());
        }

        // Consume declaration modifiers; a few forms carry parenthesized
        // payloads that are skipped whole.
        while let Some(word) = self.cur_word() {
            if !DECL_MODIFIERS.contains(&word) {
                break;
            }
            match word {
                "alignas" | "alignof" | "_Alignas" | "_Alignof" | "typeof" | "typeof_unqual" => {
                    self.bump();
                    self.skip_balanced_parens();
                }
                "static_assert" | "_Static_assert" => {
                    self.bump();
                    self.skip_balanced_parens();
                    self.eat(&Token::Semicolon);
                }
                _ => {
                    self.bump();
                }
            }
        }

        if let Some(word) = self.cur_word() {
            match word {
                "using" | "import" | "module" | "export" => {
                    let line = self.cur_line();
                    self.bump();
                    self.skip_simple_statement(line);
                    return Ok(());
                }
                "namespace" | "class" | "struct" | "union" | "enum" => {
                    return self.parse_group();
                }
                _ if word == "def" || self.types.contains_key(word) => {
                    return self.parse_declaration();
                }
                _ => {}
            }
        }

        self.parse_statement()
    }

    fn skip_balanced_parens(&mut self) {
        if self.cur() != &Token::LParen {
            return;
        }
        self.bump();
        let mut depth = 1usize;
        while depth > 0 && self.cur() != &Token::Eof {
            match self.bump() {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                _ => {}
            }
        }
    }

    /// Skips to the end of a statement that carries no code: either the
    /// next semicolon or the end of the source line.
    fn skip_simple_statement(&mut self, line: usize) {
        while self.cur() != &Token::Eof
            && self.cur() != &Token::Semicolon
            && self.cur_line() == line
            && !matches!(self.cur(), Token::Indent(_) | Token::Dedent)
        {
            self.bump();
        }
        self.eat(&Token::Semicolon);
    }

    /// `namespace`/`class`/`struct`/`union`/`enum`: the body is parsed
    /// recursively, the grouping itself contributes no code.
    fn parse_group(&mut self) -> Result<(), CompileError> {
        self.bump(); // group keyword
        if matches!(self.cur(), Token::Ident(_)) {
            self.bump();
        }
        self.skip_balanced_parens(); // base-class list

        if self.eat(&Token::LBrace) {
            while self.cur() != &Token::RBrace && self.cur() != &Token::Eof {
                self.parse_top_level()?;
            }
            self.bump();
            self.eat(&Token::Semicolon);
        } else if self.eat(&Token::Colon) {
            if matches!(self.cur(), Token::Indent(_)) {
                self.bump();
                while self.cur() != &Token::Dedent && self.cur() != &Token::Eof {
                    self.parse_top_level()?;
                }
                self.bump();
            }
        }
        Ok(())
    }

    // ── Declarations ─────────────────────────────────────────────────

    fn parse_type_name(&mut self) -> String {
        let mut type_name = String::new();
        while let Some(word) = self.cur_word() {
            if TYPE_SPEC.contains(&word) {
                if !type_name.is_empty() {
                    type_name.push(' ');
                }
                type_name.push_str(word);
                self.bump();
            } else {
                break;
            }
        }
        if type_name.is_empty() {
            if let Some(word) = self.cur_word() {
                type_name = word.to_string();
                self.bump();
            }
        }
        type_name
    }

    fn type_size(&self, type_name: &str) -> i32 {
        if let Some(info) = self.types.get(type_name) {
            return info.size;
        }
        // Multi-word specs fall back to substring heuristics.
        if type_name.contains("double") {
            8
        } else if type_name.contains("float") {
            4
        } else if type_name.contains("short") {
            2
        } else if type_name.contains("long") {
            4
        } else if type_name.contains("char") && type_name.contains("32") {
            4
        } else if type_name.contains("char") && type_name.contains("16") {
            2
        } else if type_name.contains("char") {
            1
        } else if type_name.contains("wchar") {
            2
        } else {
            4
        }
    }

    fn parse_declaration(&mut self) -> Result<(), CompileError> {
        let type_name = self.parse_type_name();
        if type_name.is_empty() {
            return Ok(());
        }
        while self.cur() == &Token::Star {
            self.bump(); // pointer declarators
        }
        let Some(name) = self.cur_word().map(str::to_string) else {
            return Ok(());
        };
        self.bump();
        let sym = self.mangle(&name);

        if self.cur() == &Token::LParen {
            self.parse_function(&sym)
        } else {
            self.parse_variable(&sym, &type_name)
        }
    }

    /// Function declaration. The body entry offset is stored under the
    /// function's name at program start, so the name is callable both
    /// directly and as a value (indirect calls).
    fn parse_function(&mut self, sym: &str) -> Result<(), CompileError> {
        self.bump(); // '('
        let mut params: Vec<String> = Vec::new();
        while self.cur() != &Token::RParen && self.cur() != &Token::Eof {
            // optional-type + identifier tuples: the last word before the
            // comma is the parameter name.
            let mut last_word: Option<String> = None;
            loop {
                match self.cur() {
                    Token::Ident(w) | Token::Keyword(w) => {
                        last_word = Some(w.clone());
                        self.bump();
                    }
                    Token::Star | Token::Amp => {
                        self.bump();
                    }
                    _ => break,
                }
            }
            // Default values and other decorations are skipped to the
            // next separator.
            while !matches!(self.cur(), Token::Comma | Token::RParen | Token::Eof) {
                self.bump();
            }
            match last_word {
                // C's empty parameter list spelling.
                Some(p) if p != "void" => params.push(p),
                _ => {}
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        if !self.eat(&Token::RParen) {
            return Err(CompileError::unexpected(
                self.cur().clone(),
                self.cur_line(),
                "parameter list",
            ));
        }

        // Prologue: store the (patched-in) body offset under the name.
        self.emit_op(OpCode::PushInt);
        let entry_operand = self.out.len();
        self.emit_i32(0);
        self.emit_op(OpCode::Store);
        self.emit_name(sym)?;
        let skip_jump = self.emit_jump(OpCode::Jmp);

        let body_start = self.out.len();
        self.symbols.insert(sym.to_string(), body_start);
        self.patch_i32(entry_operand, body_start as i32);

        // Arguments were pushed left to right: bind them in reverse.
        // Bindings carry the module prefix so body loads resolve.
        for param in params.iter().rev() {
            let slot = self.mangle(param);
            self.emit_op(OpCode::Store);
            self.emit_name(&slot)?;
        }

        self.parse_block()?;
        self.emit_op(OpCode::Ret);
        self.patch_here(skip_jump);

        if !self.module_prefix.is_empty() {
            self.emit_op(OpCode::Load);
            self.emit_name(sym)?;
            self.emit_op(OpCode::ModuleExport);
            self.emit_name(sym)?;
        }
        Ok(())
    }

    fn parse_variable(&mut self, sym: &str, type_name: &str) -> Result<(), CompileError> {
        if self.eat(&Token::LBracket) {
            self.eat(&Token::RBracket); // array declarator
        }
        if self.eat(&Token::Eq) {
            if self.eat(&Token::LBrace) {
                // Brace initializer: store into composite fields when the
                // type has a layout, else into name[i] slots.
                let fields = self
                    .types
                    .get(type_name)
                    .map(|t| t.fields.clone())
                    .unwrap_or_default();
                let mut index = 0usize;
                while self.cur() != &Token::RBrace && self.cur() != &Token::Eof {
                    self.parse_expression()?;
                    let slot = if let Some((field, _)) = fields.get(index) {
                        format!("{}.{}", sym, field)
                    } else {
                        format!("{}[{}]", sym, index)
                    };
                    index += 1;
                    self.emit_op(OpCode::Store);
                    self.emit_name(&slot)?;
                    self.eat(&Token::Comma);
                }
                self.bump(); // '}'
            } else {
                self.parse_expression()?;
                self.emit_op(OpCode::Store);
                self.emit_name(sym)?;
            }
        }
        self.eat(&Token::Semicolon);
        Ok(())
    }

    /// A block is an indented suite, a braced suite, or a single
    /// statement. A leading `:` (Python suite marker) is consumed here.
    fn parse_block(&mut self) -> Result<(), CompileError> {
        self.eat(&Token::Colon);
        match self.cur() {
            Token::Indent(_) => {
                self.bump();
                while self.cur() != &Token::Dedent && self.cur() != &Token::Eof {
                    self.parse_top_level()?;
                }
                self.bump();
            }
            Token::LBrace => {
                self.bump();
                while self.cur() != &Token::RBrace && self.cur() != &Token::Eof {
                    self.parse_top_level()?;
                }
                self.bump();
            }
            _ => {
                self.parse_top_level()?;
            }
        }
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────────

    fn parse_statement(&mut self) -> Result<(), CompileError> {
        let word = match self.cur() {
            Token::Keyword(w) => w.clone(),
            _ => {
                // Expression statement.
                self.parse_expression()?;
                self.eat(&Token::Semicolon);
                return Ok(());
            }
        };

        match word.as_str() {
            "if" => self.parse_if(),
            "while" => self.parse_while(),
            "for" => self.parse_for(),
            "try" => self.parse_try(),
            "return" => {
                self.bump();
                if self.at_statement_end() {
                    self.emit_op(OpCode::PushNull);
                } else {
                    self.parse_expression()?;
                }
                self.emit_op(OpCode::Ret);
                self.eat(&Token::Semicolon);
                Ok(())
            }
            "raise" | "throw" => {
                self.bump();
                self.parse_expression()?;
                self.emit_op(OpCode::Raise);
                self.eat(&Token::Semicolon);
                Ok(())
            }
            "assert" => self.parse_assert(),
            "yield" => {
                self.bump();
                self.parse_expression()?;
                self.eat(&Token::Semicolon);
                Ok(())
            }
            "pass" => {
                self.bump();
                self.eat(&Token::Semicolon);
                Ok(())
            }
            "del" | "global" | "nonlocal" => {
                let line = self.cur_line();
                self.bump();
                self.skip_simple_statement(line);
                Ok(())
            }
            "with" => {
                self.bump();
                while self.cur() != &Token::Colon && self.cur() != &Token::Eof {
                    self.bump();
                }
                self.parse_block()
            }
            // Accepted syntactically, skipped at statement level.
            _ => {
                let line = self.cur_line();
                self.bump();
                while self.cur() != &Token::Eof
                    && self.cur() != &Token::Semicolon
                    && self.cur() != &Token::Colon
                    && self.cur_line() == line
                {
                    self.bump();
                }
                if self.cur() == &Token::Colon {
                    self.parse_block()?;
                } else {
                    self.eat(&Token::Semicolon);
                }
                Ok(())
            }
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.cur(),
            Token::Semicolon | Token::Dedent | Token::RBrace | Token::Eof
        )
    }

    fn parse_condition(&mut self) -> Result<(), CompileError> {
        let parens = self.eat(&Token::LParen);
        self.parse_expression()?;
        if parens {
            self.eat(&Token::RParen);
        }
        Ok(())
    }

    fn parse_if(&mut self) -> Result<(), CompileError> {
        self.bump(); // 'if'
        self.parse_condition()?;
        let mut arm_jz = Some(self.emit_jump(OpCode::Jz));
        self.parse_block()?;

        let mut end_jumps = Vec::new();
        loop {
            if self.cur().is_kw("elif") {
                self.bump();
                end_jumps.push(self.emit_jump(OpCode::Jmp));
                if let Some(at) = arm_jz.take() {
                    self.patch_here(at);
                }
                self.parse_condition()?;
                arm_jz = Some(self.emit_jump(OpCode::Jz));
                self.parse_block()?;
            } else if self.cur().is_kw("else") {
                self.bump();
                // `else if` chains re-enter the if statement.
                end_jumps.push(self.emit_jump(OpCode::Jmp));
                if let Some(at) = arm_jz.take() {
                    self.patch_here(at);
                }
                if self.cur().is_kw("if") {
                    self.parse_if()?;
                } else {
                    self.parse_block()?;
                }
                break;
            } else {
                break;
            }
        }

        if let Some(at) = arm_jz {
            self.patch_here(at);
        }
        for at in end_jumps {
            self.patch_here(at);
        }
        Ok(())
    }

    fn parse_while(&mut self) -> Result<(), CompileError> {
        self.bump(); // 'while'
        let loop_top = self.out.len() as i32;
        self.parse_condition()?;
        let exit_jump = self.emit_jump(OpCode::Jz);
        self.parse_block()?;
        self.emit_op(OpCode::Jmp);
        self.emit_i32(loop_top);
        self.patch_here(exit_jump);
        Ok(())
    }

    fn parse_for(&mut self) -> Result<(), CompileError> {
        self.bump(); // 'for'

        // C-style headers are accepted syntactically: the parenthesized
        // control clause is skipped and the body runs once.
        if self.cur() == &Token::LParen {
            self.skip_balanced_parens();
            return self.parse_block();
        }

        let name = self.expect_word("for loop variable")?;
        if !self.cur().is_kw("in") {
            return Err(CompileError::unexpected_with_hint(
                self.cur().clone(),
                self.cur_line(),
                "for statement",
                "expected 'in' after the loop variable",
            ));
        }
        self.bump();
        self.parse_expression()?;

        let loop_top = self.out.len() as i32;
        let exit_jump = self.emit_jump(OpCode::ForIter);
        let slot = self.mangle(&name);
        self.emit_op(OpCode::Store);
        self.emit_name(&slot)?;
        self.parse_block()?;
        self.emit_op(OpCode::Jmp);
        self.emit_i32(loop_top);
        self.patch_here(exit_jump);
        Ok(())
    }

    fn parse_try(&mut self) -> Result<(), CompileError> {
        self.bump(); // 'try'
        let handler_entry = self.emit_jump(OpCode::TryEnter);
        self.parse_block()?;
        self.emit_op(OpCode::TryExit);
        let past_handler = self.emit_jump(OpCode::Jmp);

        self.patch_here(handler_entry);
        if self.cur().is_kw("except") || self.cur().is_kw("catch") {
            self.bump();
            let binding = self.parse_handler_binding();
            match binding {
                Some(name) => {
                    let slot = self.mangle(&name);
                    self.emit_op(OpCode::Store);
                    self.emit_name(&slot)?;
                }
                None => self.emit_op(OpCode::Pop),
            }
            self.parse_block()?;
        } else {
            // try with no handler arm: discard the raised value.
            self.emit_op(OpCode::Pop);
        }
        self.patch_here(past_handler);
        if self.cur().is_kw("finally") {
            self.bump();
            self.parse_block()?;
        }
        Ok(())
    }

    /// `except e:`, `except Type as e:`, `catch (int e)`, bare `except:`.
    /// The last word before the block is the binding name.
    fn parse_handler_binding(&mut self) -> Option<String> {
        let mut name = None;
        if self.eat(&Token::LParen) {
            while self.cur() != &Token::RParen && self.cur() != &Token::Eof {
                if let Some(w) = self.cur_word() {
                    name = Some(w.to_string());
                }
                self.bump();
            }
            self.bump();
        } else {
            while self.cur() != &Token::Colon
                && !matches!(self.cur(), Token::LBrace | Token::Indent(_) | Token::Eof)
            {
                if let Some(w) = self.cur_word() {
                    if w != "as" {
                        name = Some(w.to_string());
                    }
                }
                self.bump();
            }
        }
        name
    }

    fn parse_assert(&mut self) -> Result<(), CompileError> {
        self.bump(); // 'assert'
        self.parse_expression()?;
        let ok_jump = self.emit_jump(OpCode::Jnz);
        let count = if self.eat(&Token::Comma) {
            self.parse_expression()?;
            1
        } else {
            0
        };
        self.emit_push_int(count);
        self.emit_syscall(0xE0);
        self.patch_here(ok_jump);
        self.eat(&Token::Semicolon);
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn parse_expression(&mut self) -> Result<(), CompileError> {
        self.parse_binary(1)
    }

    /// Precedence climbing. Levels (lowest to highest): logical-or 1,
    /// logical-and 2, bit-or 3, bit-xor 4, bit-and 5, equality 6,
    /// relational 7, shift 8, additive 9, multiplicative 10.
    fn parse_binary(&mut self, min_prec: u8) -> Result<(), CompileError> {
        self.parse_unary()?;
        loop {
            let (prec, op) = match self.cur() {
                Token::OrOr => (1, OpCode::LogicalOr),
                Token::AndAnd => (2, OpCode::LogicalAnd),
                Token::Pipe => (3, OpCode::BitOr),
                Token::Caret => (4, OpCode::BitXor),
                Token::Amp => (5, OpCode::BitAnd),
                Token::EqEq => (6, OpCode::Eq),
                Token::NotEq => (6, OpCode::Ne),
                Token::Lt => (7, OpCode::Lt),
                Token::Gt => (7, OpCode::Gt),
                Token::Le => (7, OpCode::Le),
                Token::Ge => (7, OpCode::Ge),
                Token::Shl => (8, OpCode::Shl),
                Token::Shr => (8, OpCode::Shr),
                Token::Plus => (9, OpCode::Add),
                Token::Minus => (9, OpCode::Sub),
                Token::Star => (10, OpCode::Mul),
                Token::Slash => (10, OpCode::Div),
                Token::Percent => (10, OpCode::Mod),
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            self.parse_binary(prec + 1)?;
            if !self.try_fold(op) {
                self.emit_op(op);
            }
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<(), CompileError> {
        match self.cur() {
            Token::Minus => {
                self.bump();
                self.parse_unary()?;
                // Literal multiply by -1; the fold turns a literal operand
                // into a single negative push.
                self.emit_push_int(-1);
                if !self.try_fold(OpCode::Mul) {
                    self.emit_op(OpCode::Mul);
                }
                Ok(())
            }
            Token::Not => {
                self.bump();
                self.parse_unary()?;
                self.emit_op(OpCode::LogicalNot);
                Ok(())
            }
            Token::Tilde => {
                self.bump();
                self.parse_unary()?;
                self.emit_op(OpCode::BitNot);
                Ok(())
            }
            Token::Star => {
                // Pointer dereference: 4-byte read through linear memory.
                self.bump();
                self.parse_unary()?;
                self.emit_op(OpCode::ReadAddr);
                self.out.push(4);
                Ok(())
            }
            Token::Amp => {
                // Address-of is a no-op: the value already is the address.
                self.bump();
                self.parse_unary()
            }
            Token::PlusPlus | Token::MinusMinus => {
                let op = if self.cur() == &Token::PlusPlus {
                    OpCode::Add
                } else {
                    OpCode::Sub
                };
                self.bump();
                let name = self.expect_word("prefix increment")?;
                let sym = self.mangle(&name);
                self.emit_op(OpCode::Load);
                self.emit_name(&sym)?;
                self.emit_push_int(1);
                self.emit_op(op);
                self.emit_op(OpCode::Store);
                self.emit_name(&sym)?;
                self.emit_op(OpCode::Load);
                self.emit_name(&sym)?;
                Ok(())
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<(), CompileError> {
        match self.cur().clone() {
            Token::LParen => {
                self.bump();
                self.parse_expression()?;
                self.eat(&Token::RParen);
                Ok(())
            }
            Token::LBracket => self.parse_list_literal(),
            Token::LBrace => self.parse_dict_literal(),
            Token::Int(n) => {
                self.bump();
                self.emit_push_int(n as i32);
                Ok(())
            }
            Token::Str(s) => {
                self.bump();
                self.emit_string_literal(&s);
                Ok(())
            }
            Token::FStringPart(_) | Token::LBraceExp => self.parse_fstring(),
            Token::Keyword(word) => self.parse_keyword_primary(&word),
            Token::Ident(name) => {
                self.bump();
                self.parse_name_expression(name)
            }
            other => Err(CompileError::unexpected(other, self.cur_line(), "expression")),
        }
    }

    fn parse_list_literal(&mut self) -> Result<(), CompileError> {
        self.bump(); // '['
        self.emit_op(OpCode::ListNew);
        while self.cur() != &Token::RBracket && self.cur() != &Token::Eof {
            self.parse_expression()?;
            self.emit_op(OpCode::ListAppend);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.eat(&Token::RBracket);
        Ok(())
    }

    fn parse_dict_literal(&mut self) -> Result<(), CompileError> {
        self.bump(); // '{'
        self.emit_op(OpCode::DictNew);
        while self.cur() != &Token::RBrace && self.cur() != &Token::Eof {
            self.parse_expression()?;
            if !self.eat(&Token::Colon) {
                return Err(CompileError::unexpected_with_hint(
                    self.cur().clone(),
                    self.cur_line(),
                    "dict literal",
                    "expected ':' between key and value",
                ));
            }
            self.parse_expression()?;
            self.emit_op(OpCode::DictSet);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.eat(&Token::RBrace);
        Ok(())
    }

    /// F-string reassembly: each part is pushed (expressions go through
    /// TO_STRING) and the pieces are glued with ADD.
    fn parse_fstring(&mut self) -> Result<(), CompileError> {
        let mut first = true;
        loop {
            match self.cur().clone() {
                Token::FStringPart(part) => {
                    self.bump();
                    self.emit_string_literal(&part);
                }
                Token::LBraceExp => {
                    self.bump();
                    self.parse_expression()?;
                    if !self.eat(&Token::RBraceExp) {
                        return Err(CompileError::unexpected(
                            self.cur().clone(),
                            self.cur_line(),
                            "f-string interpolation",
                        ));
                    }
                    self.emit_op(OpCode::ToString);
                }
                _ => break,
            }
            if first {
                first = false;
            } else {
                self.emit_op(OpCode::Add);
            }
        }
        if first {
            self.emit_string_literal("");
        }
        Ok(())
    }

    fn parse_keyword_primary(&mut self, word: &str) -> Result<(), CompileError> {
        match word {
            "nullptr" | "None" | "False" | "false" => {
                self.bump();
                self.emit_push_int(0);
                Ok(())
            }
            "True" | "true" => {
                self.bump();
                self.emit_push_int(1);
                Ok(())
            }
            "sizeof" => {
                self.bump();
                let parens = self.eat(&Token::LParen);
                let type_name = self.parse_type_name();
                if parens {
                    self.eat(&Token::RParen);
                }
                let size = self.type_size(&type_name);
                self.emit_push_int(size);
                Ok(())
            }
            // Builtins that share keyword spellings (`int(x)`, `str(v)`).
            _ if self.peek() == &Token::LParen
                && SYSCALL_FNS.iter().any(|(n, _)| *n == word) =>
            {
                let name = word.to_string();
                self.bump();
                self.parse_name_expression(name)
            }
            _ => Err(CompileError::unexpected_with_hint(
                Token::Keyword(word.to_string()),
                self.cur_line(),
                "expression",
                "this keyword has no value form",
            )),
        }
    }

    /// Identifier continuation: dotted/arrow chains, calls, indexing,
    /// assignment forms, walrus, postfix increment, or a plain load.
    fn parse_name_expression(&mut self, mut name: String) -> Result<(), CompileError> {
        while matches!(self.cur(), Token::Dot | Token::Arrow) {
            self.bump();
            let part = self.expect_word("member access")?;
            name.push('.');
            name.push_str(&part);
        }

        match self.cur() {
            Token::LParen => {
                self.bump();
                let mut count = 0i32;
                while self.cur() != &Token::RParen && self.cur() != &Token::Eof {
                    self.parse_expression()?;
                    count += 1;
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.eat(&Token::RParen);
                self.emit_call(&name, count)
            }
            Token::LBracket => {
                let load_name = self.load_name(&name);
                self.emit_op(OpCode::Load);
                self.emit_name(&load_name)?;
                loop {
                    self.bump(); // '['
                    self.parse_expression()?;
                    self.eat(&Token::RBracket);
                    if self.cur() == &Token::LBracket {
                        self.emit_op(OpCode::DictGet);
                        continue;
                    }
                    break;
                }
                if self.eat(&Token::Eq) {
                    self.parse_expression()?;
                    self.emit_op(OpCode::DictSet);
                    // DICT_SET leaves the receiver for literal chains;
                    // statement assignment discards it.
                    self.emit_op(OpCode::Pop);
                } else {
                    self.emit_op(OpCode::DictGet);
                }
                Ok(())
            }
            Token::Eq => {
                self.bump();
                self.parse_expression()?;
                self.emit_op(OpCode::Store);
                let sym = self.mangle(&name);
                self.emit_name(&sym)
            }
            Token::ColonEq => {
                // Walrus: store, then load back as the expression value.
                self.bump();
                self.parse_expression()?;
                let sym = self.mangle(&name);
                self.emit_op(OpCode::Store);
                self.emit_name(&sym)?;
                self.emit_op(OpCode::Load);
                self.emit_name(&sym)
            }
            Token::PlusEq | Token::MinusEq | Token::StarEq | Token::SlashEq
            | Token::PercentEq | Token::ShlEq | Token::ShrEq | Token::AndEq | Token::OrEq
            | Token::XorEq => {
                let op = match self.cur() {
                    Token::PlusEq => OpCode::Add,
                    Token::MinusEq => OpCode::Sub,
                    Token::StarEq => OpCode::Mul,
                    Token::SlashEq => OpCode::Div,
                    Token::PercentEq => OpCode::Mod,
                    Token::ShlEq => OpCode::Shl,
                    Token::ShrEq => OpCode::Shr,
                    Token::AndEq => OpCode::BitAnd,
                    Token::OrEq => OpCode::BitOr,
                    _ => OpCode::BitXor,
                };
                self.bump();
                let sym = self.mangle(&name);
                self.emit_op(OpCode::Load);
                self.emit_name(&sym)?;
                self.parse_expression()?;
                self.emit_op(op);
                self.emit_op(OpCode::Store);
                self.emit_name(&sym)
            }
            Token::PlusPlus | Token::MinusMinus => {
                let op = if self.cur() == &Token::PlusPlus {
                    OpCode::Add
                } else {
                    OpCode::Sub
                };
                self.bump();
                let sym = self.mangle(&name);
                self.emit_op(OpCode::Load);
                self.emit_name(&sym)?;
                self.emit_push_int(1);
                self.emit_op(op);
                self.emit_op(OpCode::Store);
                self.emit_name(&sym)
            }
            _ => {
                // Constants and variable loads.
                match name.as_str() {
                    "math.pi" => {
                        self.emit_push_int(0);
                        self.emit_syscall(0xB2);
                    }
                    "math.e" => {
                        self.emit_push_int(0);
                        self.emit_syscall(0xB3);
                    }
                    _ => {
                        let load_name = self.load_name(&name);
                        self.emit_op(OpCode::Load);
                        self.emit_name(&load_name)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Dotted names load verbatim; simple names pick up the module prefix.
    fn load_name(&self, name: &str) -> String {
        if name.contains('.') {
            name.to_string()
        } else {
            self.mangle(name)
        }
    }

    /// Call lowering: known host functions become syscalls (count pushed
    /// last), dotted method suffixes load their receiver first, anything
    /// else is a direct CALL by name.
    fn emit_call(&mut self, name: &str, count: i32) -> Result<(), CompileError> {
        if let Some((_, id)) = SYSCALL_FNS.iter().find(|(n, _)| *n == name) {
            self.emit_push_int(count);
            self.emit_syscall(*id);
            return Ok(());
        }
        for (suffix, id) in METHOD_SUFFIXES {
            if let Some(receiver) = name.strip_suffix(suffix) {
                if receiver.is_empty() {
                    continue;
                }
                let receiver = self.load_name(receiver);
                self.emit_op(OpCode::Load);
                self.emit_name(&receiver)?;
                self.emit_push_int(count);
                self.emit_syscall(*id);
                return Ok(());
            }
        }
        let target = self.load_name(name);
        self.emit_op(OpCode::Call);
        self.emit_name(&target)
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
