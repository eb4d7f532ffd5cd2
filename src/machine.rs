use std::cmp::Ordering;
use std::collections::HashMap;

use log::debug;

use crate::{
  error::{Error, Result},
  opcode::{Opcode, OpcodeKind},
  query_context::{BoundValue, ValueBindings},
  silo::Silo,
  stack::{Stack, TextValue, Value},
  strings,
  strtab::UNSET,
};

/// Parse recursion limit for bracketed sub-expressions.
const MAX_PARSE_DEPTH: usize = 20;

/// Default capacity of the evaluation stack.
pub const STACK_SIZE_DEFAULT: usize = 10;

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct MachineParseFlags: u32 {
    /// Run a constant-folding pass on the parsed predicate.
    const OPTIMIZE = 1 << 0;
  }
}

/// The node the executor is currently looking at, plus its 1-based position
/// within the sibling run being matched.
#[derive(Debug, Clone, Copy)]
pub struct QueryData {
  pub offset: u32,
  pub position: u32,
}

/// Everything a function callback may need during one evaluation. The
/// optimizer runs with an empty context, which is how silo-dependent
/// functions refuse to be speculatively folded.
#[derive(Default)]
pub struct EvalContext<'a> {
  pub(crate) silo: Option<&'a Silo>,
  pub(crate) query_data: Option<QueryData>,
  pub(crate) bindings: Option<&'a ValueBindings>,
}

impl<'a> EvalContext<'a> {
  pub(crate) fn silo(&self) -> Result<&'a Silo> {
    self
      .silo
      .ok_or_else(|| Error::NotSupported("no silo to query".to_string()))
  }

  pub(crate) fn query_data(&self) -> Result<QueryData> {
    self
      .query_data
      .ok_or_else(|| Error::NotSupported("no node being queried".to_string()))
  }
}

/// A registered function. Methods added with [`Machine::add_method`] depend
/// on per-execution data and are never constant-folded.
pub type MethodFunc = for<'a> fn(&Machine, &mut Stack<'a>, &EvalContext<'a>) -> Result<()>;

struct MachineFunc {
  name: String,
  arity: usize,
  pure: bool,
  func: MethodFunc,
}

struct MachineOperator {
  token: String,
  name: String,
}

/// Rewrites an opcode sequence whose signature matched at parse time.
pub type OpcodeFixupFunc = fn(&Machine, &mut Vec<Opcode>) -> Result<()>;

/// Turns an unrecognised bare token into opcodes; returns true when handled.
pub type TextHandlerFunc = fn(&Machine, &mut Vec<Opcode>, &str) -> Result<bool>;

/// The expression virtual machine: parses XPath predicates into opcode
/// sequences and evaluates them against a stack.
///
/// The registries are filled at construction time and frozen before any
/// query runs, so a `Machine` can be shared between threads freely.
pub struct Machine {
  funcs: Vec<MachineFunc>,
  operators: Vec<MachineOperator>,
  text_handlers: Vec<TextHandlerFunc>,
  opcode_fixups: HashMap<String, OpcodeFixupFunc>,
  stack_size: usize,
}

impl Default for Machine {
  fn default() -> Self {
    Self::new()
  }
}

impl Machine {
  /// Creates a machine with the built-in functions and operators
  /// registered.
  pub fn new() -> Self {
    let mut machine = Self {
      funcs: Vec::new(),
      operators: Vec::new(),
      text_handlers: Vec::new(),
      opcode_fixups: HashMap::new(),
      stack_size: STACK_SIZE_DEFAULT,
    };

    machine.add_func("eq", 2, func_eq);
    machine.add_func("ne", 2, func_ne);
    machine.add_func("lt", 2, func_lt);
    machine.add_func("gt", 2, func_gt);
    machine.add_func("le", 2, func_le);
    machine.add_func("ge", 2, func_ge);
    machine.add_func("contains", 2, func_contains);
    machine.add_func("starts-with", 2, func_starts_with);
    machine.add_func("ends-with", 2, func_ends_with);
    machine.add_func("string-length", 1, func_string_length);
    machine.add_func("number", 1, func_number);
    machine.add_func("string", 1, func_string);
    machine.add_func("not", 1, func_not);
    machine.add_func("and", 2, func_and);
    machine.add_func("or", 2, func_or);
    machine.add_func("lower-case", 1, func_lower);
    machine.add_func("upper-case", 1, func_upper);

    machine.add_operator("!=", "ne");
    machine.add_operator("<=", "le");
    machine.add_operator(">=", "ge");
    machine.add_operator("~=", "contains");
    machine.add_operator("==", "eq");
    machine.add_operator("=", "eq");
    machine.add_operator(">", "gt");
    machine.add_operator("<", "lt");

    machine
  }

  /// Adds a pure function, eligible for constant folding.
  pub fn add_func(&mut self, name: &str, n_args: usize, func: MethodFunc) {
    self.funcs.push(MachineFunc {
      name: name.to_string(),
      arity: n_args,
      pure: true,
      func,
    });
  }

  /// Adds a method that reads per-execution data and so is never folded.
  pub fn add_method(&mut self, name: &str, n_args: usize, func: MethodFunc) {
    self.funcs.push(MachineFunc {
      name: name.to_string(),
      arity: n_args,
      pure: false,
      func,
    });
  }

  /// Maps an operator token such as `<=` to a registered function name.
  /// Re-registering a token rebinds it: the most recent mapping wins.
  pub fn add_operator(&mut self, token: &str, name: &str) {
    self.operators.push(MachineOperator {
      token: token.to_string(),
      name: name.to_string(),
    });
  }

  /// Registers a rewrite for opcode sequences with the given comma-joined
  /// signature, e.g. `TEXT,FUNC:attr`.
  pub fn add_opcode_fixup(&mut self, opcodes_sig: &str, func: OpcodeFixupFunc) {
    self.opcode_fixups.insert(opcodes_sig.to_string(), func);
  }

  /// Adds a handler for bare tokens the literal parser does not recognise,
  /// e.g. to translate `@name` into `'name',attr()`.
  pub fn add_text_handler(&mut self, func: TextHandlerFunc) {
    self.text_handlers.push(func);
  }

  pub fn set_stack_size(&mut self, stack_size: usize) {
    self.stack_size = stack_size;
  }

  pub fn stack_size(&self) -> usize {
    self.stack_size
  }

  fn find_func(&self, name: &str) -> Option<u32> {
    self
      .funcs
      .iter()
      .position(|f| f.name == name)
      .map(|idx| idx as u32)
  }

  /// Creates a function-call opcode for a registered function.
  pub fn opcode_func(&self, name: &str) -> Result<Opcode> {
    self
      .find_func(name)
      .map(Opcode::func)
      .ok_or_else(|| Error::NotSupported(format!("function {}() is not supported", name)))
  }

  pub fn func_name(&self, idx: u32) -> Option<&str> {
    self.funcs.get(idx as usize).map(|f| f.name.as_str())
  }

  /// Parses an XPath predicate, e.g. `contains(text(),'xyz')`.
  pub fn parse(&self, text: &str) -> Result<Vec<Opcode>> {
    self.parse_full(text, MachineParseFlags::empty())
  }

  /// Parses an XPath predicate and applies registered fixups, optionally
  /// folding constant sub-expressions.
  pub fn parse_full(&self, text: &str, flags: MachineParseFlags) -> Result<Vec<Opcode>> {
    if text.is_empty() {
      return Err(Error::InvalidData("predicate was zero size".to_string()));
    }
    let mut opcodes = Vec::new();
    self.parse_expr(&mut opcodes, text, 0)?;

    // do any fixups
    let sig = self.opcodes_sig(&opcodes);
    if let Some(fixup) = self.opcode_fixups.get(sig.as_str()) {
      debug!("running fixup for signature {}", sig);
      fixup(self, &mut opcodes)?;
    }

    if flags.contains(MachineParseFlags::OPTIMIZE) {
      self.optimize(&mut opcodes);
    }
    Ok(opcodes)
  }

  /// Splits on a logical operator outside brackets and quotes, lowest
  /// precedence first, then on a comparison operator, then falls back to the
  /// bracket parser.
  fn parse_expr(&self, opcodes: &mut Vec<Opcode>, text: &str, level: usize) -> Result<()> {
    if level > MAX_PARSE_DEPTH {
      return Err(Error::InvalidData(format!(
        "nesting deeper than {} levels supported: {}",
        MAX_PARSE_DEPTH, text
      )));
    }
    if let Some((idx, token_len, name)) = find_logic_split(text) {
      let func = self.opcode_func(name)?;
      self.parse_expr(opcodes, &text[..idx], level)?;
      self.parse_expr(opcodes, &text[idx + token_len..], level)?;
      opcodes.push(func);
      return Ok(());
    }
    if let Some((idx, token_len, name)) = self.find_operator_split(text) {
      let func = self.opcode_func(&name)?;
      self.parse_part(opcodes, &text[..idx], level)?;
      self.parse_part(opcodes, &text[idx + token_len..], level)?;
      opcodes.push(func);
      return Ok(());
    }
    self.parse_part(opcodes, text, level)
  }

  /// Finds the leftmost comparison operator outside string literals and
  /// brackets; at a given position the longest token wins and, for equal
  /// tokens, the most recently registered mapping.
  fn find_operator_split(&self, text: &str) -> Option<(usize, usize, String)> {
    let bytes = text.as_bytes();
    let mut in_quote = false;
    let mut depth = 0i32;
    for i in 0..bytes.len() {
      match bytes[i] {
        b'\'' => {
          in_quote = !in_quote;
          continue;
        }
        _ if in_quote => continue,
        b'(' => {
          depth += 1;
          continue;
        }
        b')' => {
          depth -= 1;
          continue;
        }
        _ if depth > 0 => continue,
        _ => {}
      }
      let mut best: Option<&MachineOperator> = None;
      for op in &self.operators {
        if bytes[i..].starts_with(op.token.as_bytes()) {
          let better = match best {
            None => true,
            Some(b) => op.token.len() >= b.token.len(),
          };
          if better {
            best = Some(op);
          }
        }
      }
      if let Some(op) = best {
        return Some((i, op.token.len(), op.name.clone()));
      }
    }
    None
  }

  fn parse_part(&self, opcodes: &mut Vec<Opcode>, text: &str, level: usize) -> Result<()> {
    match self.parse_section(opcodes, text, 0, level)? {
      SectionEnd::End => Ok(()),
      SectionEnd::Close(idx) => Err(Error::InvalidData(format!(
        "unbalanced closing bracket at offset {} in `{}`",
        idx, text
      ))),
    }
  }

  /// Builds an accumulator until hitting either bracket, then recurses.
  fn parse_section(
    &self,
    opcodes: &mut Vec<Opcode>,
    text: &str,
    start: usize,
    level: usize,
  ) -> Result<SectionEnd> {
    if level > MAX_PARSE_DEPTH {
      return Err(Error::InvalidData(format!(
        "nesting deeper than {} levels supported: {}",
        MAX_PARSE_DEPTH, text
      )));
    }
    let bytes = text.as_bytes();
    let mut acc = String::new();
    let mut i = start;
    while i < bytes.len() {
      match bytes[i] {
        b'\'' => {
          // consume the quoted literal verbatim, quotes included
          let close = memchr::memchr(b'\'', &bytes[i + 1..])
            .map(|p| i + 1 + p)
            .ok_or_else(|| {
              Error::InvalidData(format!("unterminated string literal in `{}`", text))
            })?;
          acc.push_str(&text[i..=close]);
          i = close + 1;
        }
        b',' => {
          self.parse_flush(opcodes, &acc, level)?;
          acc.clear();
          i += 1;
        }
        b'(' => match self.parse_section(opcodes, text, i + 1, level + 1)? {
          SectionEnd::Close(end) => {
            if !acc.is_empty() {
              self.parse_add_func(opcodes, &acc)?;
              acc.clear();
            }
            i = end + 1;
          }
          SectionEnd::End => {
            return Err(Error::InvalidData(format!(
              "failed to find matching bracket in `{}`",
              text
            )))
          }
        },
        b')' => {
          self.parse_flush(opcodes, &acc, level)?;
          return Ok(SectionEnd::Close(i));
        }
        _ => {
          let next = bytes[i..]
            .iter()
            .position(|&b| matches!(b, b'\'' | b',' | b'(' | b')'))
            .map(|p| i + p)
            .unwrap_or(bytes.len());
          acc.push_str(&text[i..next]);
          i = next;
        }
      }
    }
    self.parse_flush(opcodes, &acc, level)?;
    Ok(SectionEnd::End)
  }

  /// Flushes an accumulated buffer: a nested expression in an argument
  /// position gets re-parsed, anything else is a literal.
  fn parse_flush(&self, opcodes: &mut Vec<Opcode>, acc: &str, level: usize) -> Result<()> {
    if acc.is_empty() {
      return Ok(());
    }
    if find_logic_split(acc).is_some() || self.find_operator_split(acc).is_some() {
      return self.parse_expr(opcodes, acc, level);
    }
    self.parse_add_text(opcodes, acc)
  }

  fn parse_add_func(&self, opcodes: &mut Vec<Opcode>, name: &str) -> Result<()> {
    opcodes.push(self.opcode_func(name)?);
    Ok(())
  }

  fn parse_add_text(&self, opcodes: &mut Vec<Opcode>, text: &str) -> Result<()> {
    // never add empty literals
    if text.is_empty() {
      return Ok(());
    }

    // do any additional handlers
    for handler in &self.text_handlers {
      if handler(self, opcodes, text)? {
        return Ok(());
      }
    }

    // quoted text
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
      opcodes.push(Opcode::text(&text[1..text.len() - 1]));
      return Ok(());
    }

    // bound value, numbered by the query compiler
    if text == "?" {
      opcodes.push(Opcode::bound());
      return Ok(());
    }

    // plain integer
    if text.bytes().all(|b| b.is_ascii_digit()) {
      let val: u32 = text
        .parse()
        .map_err(|_| Error::InvalidData(format!("invalid integer literal `{}`", text)))?;
      opcodes.push(Opcode::integer(val));
      return Ok(());
    }

    // not supported
    Err(Error::NotSupported(format!(
      "cannot parse text or number `{}`",
      text
    )))
  }

  /// Comma-joined signature of an opcode sequence, e.g.
  /// `TEXT,FUNC:attr,TEXT,FUNC:eq`.
  pub fn opcodes_sig(&self, opcodes: &[Opcode]) -> String {
    opcodes
      .iter()
      .map(|op| match op.kind() {
        OpcodeKind::Function => {
          format!("FUNC:{}", self.func_name(op.val()).unwrap_or("???"))
        }
        kind => kind.sig().to_string(),
      })
      .collect::<Vec<_>>()
      .join(",")
  }

  /// Folds constant sub-sequences by running them speculatively. A failed
  /// speculative run is a private signal that just blocks the fold.
  fn optimize(&self, opcodes: &mut Vec<Opcode>) {
    let mut i = 0;
    while i < opcodes.len() {
      let folded = self.try_fold_at(opcodes, i);
      if folded {
        // chained folds may now be possible earlier in the sequence
        i = 0;
      } else {
        i += 1;
      }
    }
  }

  fn try_fold_at(&self, opcodes: &mut Vec<Opcode>, i: usize) -> bool {
    if opcodes[i].kind() != OpcodeKind::Function {
      return false;
    }
    let func = match self.funcs.get(opcodes[i].val() as usize) {
      Some(func) => func,
      None => return false,
    };
    if !func.pure || func.arity == 0 || i < func.arity {
      return false;
    }
    let start = i - func.arity;
    let constant = opcodes[start..i].iter().all(|op| {
      matches!(
        op.kind(),
        OpcodeKind::Integer | OpcodeKind::Text | OpcodeKind::Boolean
      )
    });
    if !constant {
      return false;
    }
    match self.run_fragment(&opcodes[start..=i]) {
      Ok(Some(op)) => {
        debug!(
          "folded {} opcodes into {}",
          i - start + 1,
          op
        );
        opcodes.splice(start..=i, [op]);
        true
      }
      _ => false,
    }
  }

  /// Speculatively evaluates a constant fragment, converting the single
  /// remaining stack value back to an opcode.
  fn run_fragment(&self, ops: &[Opcode]) -> Result<Option<Opcode>> {
    let ctx = EvalContext::default();
    let mut stack = Stack::new(self.stack_size);
    self.run_ops(ops, &ctx, &mut stack)?;
    if stack.len() != 1 {
      return Ok(None);
    }
    let op = match stack.pop()? {
      Value::Integer(val) => Opcode::integer(val),
      Value::Boolean(val) => Opcode::boolean(val),
      Value::Text(text) => match text.str {
        Some(s) => Opcode::text(s.into_owned()),
        None => return Ok(None),
      },
    };
    Ok(Some(op))
  }

  fn run_ops<'a>(
    &self,
    opcodes: &'a [Opcode],
    ctx: &EvalContext<'a>,
    stack: &mut Stack<'a>,
  ) -> Result<()> {
    for op in opcodes {
      match op.kind() {
        OpcodeKind::Integer => stack.push(Value::Integer(op.val()))?,
        OpcodeKind::Boolean => stack.push(Value::Boolean(op.val() != 0))?,
        OpcodeKind::Text | OpcodeKind::IndexedText => {
          stack.push(Value::Text(text_value_for_opcode(op)))?
        }
        OpcodeKind::Bound => {
          let bindings = ctx.bindings.ok_or_else(|| {
            Error::InvalidArgument(format!("no bound value at index {}", op.val()))
          })?;
          match bindings.lookup(op.val() as usize) {
            Some(BoundValue::Text(s)) => stack.push(Value::text(s.as_str()))?,
            Some(BoundValue::Integer(val)) => stack.push(Value::Integer(*val))?,
            None => {
              return Err(Error::InvalidArgument(format!(
                "no bound value at index {}",
                op.val()
              )))
            }
          }
        }
        OpcodeKind::Function => {
          let func = self.funcs.get(op.val() as usize).ok_or_else(|| {
            Error::InvalidData(format!("opcode function {} not recognised", op.val()))
          })?;
          if func.arity > stack.len() {
            return Err(Error::NotSupported(format!(
              "{}() requires {} arguments, stack only has {}",
              func.name,
              func.arity,
              stack.len()
            )));
          }
          (func.func)(self, stack, ctx)
            .map_err(|e| prefix_error(e, &format!("failed to call {}(): ", func.name)))?;
        }
      }
    }
    Ok(())
  }

  /// Runs a parsed predicate. The run must leave exactly one boolean on the
  /// stack, which becomes the result; any remainder is invalid-data.
  pub fn run<'a>(&self, opcodes: &'a [Opcode], ctx: &EvalContext<'a>) -> Result<bool> {
    let mut stack = Stack::new(self.stack_size);
    self.run_ops(opcodes, ctx, &mut stack)?;
    match stack.pop() {
      Ok(Value::Boolean(val)) => {
        if !stack.is_empty() {
          return Err(Error::InvalidData(format!(
            "{} opcodes remain on the stack ({})",
            stack.len(),
            stack.describe()
          )));
        }
        Ok(val)
      }
      Ok(value) => Err(Error::InvalidData(format!(
        "predicate evaluated to {} instead of a boolean",
        value
      ))),
      Err(_) => Err(Error::InvalidData(
        "stack was empty at end of evaluation".to_string(),
      )),
    }
  }
}

enum SectionEnd {
  /// Consumed the input to its end.
  End,
  /// Stopped at a closing bracket at this byte index.
  Close(usize),
}

pub(crate) fn prefix_error(err: Error, prefix: &str) -> Error {
  match err {
    Error::InvalidData(msg) => Error::InvalidData(format!("{}{}", prefix, msg)),
    Error::NotSupported(msg) => Error::NotSupported(format!("{}{}", prefix, msg)),
    Error::NotFound(msg) => Error::NotFound(format!("{}{}", prefix, msg)),
    Error::InvalidArgument(msg) => Error::InvalidArgument(format!("{}{}", prefix, msg)),
    other => other,
  }
}

fn text_value_for_opcode(op: &Opcode) -> TextValue<'_> {
  let mut text = match op.text_str() {
    Some(s) => TextValue::new(s),
    None => TextValue::null(),
  };
  if op.kind() == OpcodeKind::IndexedText {
    text = text.with_index(op.val());
  }
  text.tokenized = op.is_tokenized();
  text.tokens = op.tokens().iter().map(|t| t.as_str().into()).collect();
  text
}

/// Finds the leftmost logical operator outside brackets and quotes; these
/// bind less tightly than the comparison operators.
fn find_logic_split(text: &str) -> Option<(usize, usize, &'static str)> {
  const TOKENS: [(&str, &str); 4] = [
    ("&&", "and"),
    ("||", "or"),
    (" and ", "and"),
    (" or ", "or"),
  ];
  let bytes = text.as_bytes();
  let mut depth = 0i32;
  let mut in_quote = false;
  for i in 0..bytes.len() {
    match bytes[i] {
      b'\'' => {
        in_quote = !in_quote;
        continue;
      }
      _ if in_quote => continue,
      b'(' => {
        depth += 1;
        continue;
      }
      b')' => {
        depth -= 1;
        continue;
      }
      _ if depth > 0 => continue,
      _ => {}
    }
    for (token, name) in TOKENS {
      if bytes[i..].starts_with(token.as_bytes()) {
        return Some((i, token.len(), name));
      }
    }
  }
  None
}

/// Compares the two popped operands, `(op2 ORD op1)`. Returns `None` when
/// the operands cannot match (e.g. a missing attribute), which the
/// comparators turn into `false`.
fn cmp_values(op1: &Value<'_>, op2: &Value<'_>) -> Result<Option<Ordering>> {
  match (op1, op2) {
    // TEXT:TEXT
    (Value::Text(t1), Value::Text(t2)) => {
      if t1.index != UNSET && t1.index == t2.index {
        return Ok(Some(Ordering::Equal));
      }
      Ok(Some(t2.as_str().cmp(&t1.as_str())))
    }
    // INTE:TEXT
    (v1, Value::Text(t2)) => {
      let rhs = match v1.as_int() {
        Some(rhs) => rhs,
        None => {
          return Err(Error::NotSupported(format!(
            "{}:{} types not supported",
            op1.kind_str(),
            op2.kind_str()
          )))
        }
      };
      let s = match t2.as_str() {
        Some(s) => s,
        None => return Ok(None),
      };
      if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidData(format!(
          "cannot parse `{}` as an integer",
          s
        )));
      }
      let parsed: u32 = s
        .parse()
        .map_err(|_| Error::InvalidData(format!("cannot parse `{}` as an integer", s)))?;
      Ok(Some(parsed.cmp(&rhs)))
    }
    // INTE:INTE
    (v1, v2) => match (v1.as_int(), v2.as_int()) {
      (Some(i1), Some(i2)) => Ok(Some(i2.cmp(&i1))),
      _ => Err(Error::NotSupported(format!(
        "{}:{} types not supported",
        op1.kind_str(),
        op2.kind_str()
      ))),
    },
  }
}

fn func_cmp(
  stack: &mut Stack<'_>,
  accept: fn(Ordering) -> bool,
) -> Result<()> {
  let (op1, op2) = stack.pop_two()?;
  let result = match cmp_values(&op1, &op2)? {
    Some(ordering) => accept(ordering),
    None => false,
  };
  stack.push(Value::Boolean(result))
}

fn func_eq(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  func_cmp(stack, |o| o == Ordering::Equal)
}

fn func_ne(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  func_cmp(stack, |o| o != Ordering::Equal)
}

fn func_lt(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  func_cmp(stack, |o| o == Ordering::Less)
}

fn func_gt(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  func_cmp(stack, |o| o == Ordering::Greater)
}

fn func_le(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  func_cmp(stack, |o| o != Ordering::Greater)
}

fn func_ge(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  func_cmp(stack, |o| o != Ordering::Less)
}

fn pop_two_text<'a>(stack: &mut Stack<'a>) -> Result<(TextValue<'a>, TextValue<'a>)> {
  let (op1, op2) = stack.pop_two()?;
  match (op1, op2) {
    (Value::Text(t1), Value::Text(t2)) => Ok((t1, t2)),
    (op1, op2) => Err(Error::NotSupported(format!(
      "{}:{} types not supported",
      op1.kind_str(),
      op2.kind_str()
    ))),
  }
}

fn func_contains(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  let (needle, haystack) = pop_two_text(stack)?;
  let result = match (haystack.as_str(), needle.as_str()) {
    (Some(h), Some(n)) => strings::contains(h, n),
    _ => false,
  };
  stack.push(Value::Boolean(result))
}

fn func_starts_with(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  let (needle, haystack) = pop_two_text(stack)?;
  let result = match (haystack.as_str(), needle.as_str()) {
    (Some(h), Some(n)) => h.starts_with(n),
    _ => false,
  };
  stack.push(Value::Boolean(result))
}

fn func_ends_with(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  let (needle, haystack) = pop_two_text(stack)?;
  let result = match (haystack.as_str(), needle.as_str()) {
    (Some(h), Some(n)) => h.ends_with(n),
    _ => false,
  };
  stack.push(Value::Boolean(result))
}

fn func_string_length(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  match stack.pop()? {
    Value::Text(text) => {
      let len = text.as_str().map(|s| s.len()).unwrap_or(0);
      stack.push(Value::Integer(len as u32))
    }
    value => Err(Error::NotSupported(format!(
      "{} type not supported",
      value.kind_str()
    ))),
  }
}

fn func_number(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  match stack.pop()? {
    Value::Text(text) => {
      let s = text.as_str().ok_or_else(|| {
        Error::NotSupported("cannot convert missing text to a number".to_string())
      })?;
      if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidData(format!(
          "cannot parse `{}` as an integer",
          s
        )));
      }
      let val: u32 = s
        .parse()
        .map_err(|_| Error::InvalidData(format!("cannot parse `{}` as an integer", s)))?;
      stack.push(Value::Integer(val))
    }
    value => Err(Error::NotSupported(format!(
      "{} type not supported",
      value.kind_str()
    ))),
  }
}

fn func_string(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  let value = match stack.pop()? {
    Value::Integer(val) => Value::text(val.to_string()),
    Value::Boolean(val) => Value::text(if val { "true" } else { "false" }),
    text @ Value::Text(_) => text,
  };
  stack.push(value)
}

fn func_not(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  match stack.pop()? {
    Value::Boolean(val) => stack.push(Value::Boolean(!val)),
    value => Err(Error::NotSupported(format!(
      "{} type not supported",
      value.kind_str()
    ))),
  }
}

fn pop_two_bool(stack: &mut Stack<'_>) -> Result<(bool, bool)> {
  let (op1, op2) = stack.pop_two()?;
  match (op1.as_int(), op2.as_int()) {
    (Some(v1), Some(v2)) => Ok((v1 != 0, v2 != 0)),
    _ => Err(Error::NotSupported(format!(
      "{}:{} types not supported",
      op1.kind_str(),
      op2.kind_str()
    ))),
  }
}

fn func_and(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  let (b1, b2) = pop_two_bool(stack)?;
  stack.push(Value::Boolean(b1 && b2))
}

fn func_or(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  let (b1, b2) = pop_two_bool(stack)?;
  stack.push(Value::Boolean(b1 || b2))
}

fn func_lower(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  match stack.pop()? {
    Value::Text(text) => {
      let s = text
        .as_str()
        .ok_or_else(|| Error::NotSupported("cannot case-fold missing text".to_string()))?;
      stack.push(Value::text(s.to_ascii_lowercase()))
    }
    value => Err(Error::NotSupported(format!(
      "{} type not supported",
      value.kind_str()
    ))),
  }
}

fn func_upper(_: &Machine, stack: &mut Stack<'_>, _: &EvalContext<'_>) -> Result<()> {
  match stack.pop()? {
    Value::Text(text) => {
      let s = text
        .as_str()
        .ok_or_else(|| Error::NotSupported("cannot case-fold missing text".to_string()))?;
      stack.push(Value::text(s.to_ascii_uppercase()))
    }
    value => Err(Error::NotSupported(format!(
      "{} type not supported",
      value.kind_str()
    ))),
  }
}
