use std::collections::HashSet;
use std::sync::Arc;

use crate::{
  error::{Error, Result},
  machine::QueryData,
  node::Node,
  query::{Query, QueryFlags, SectionKind},
  query_context::QueryContext,
  silo::{run_predicate, Silo},
  strtab::UNSET,
};

/// Runs a compiled query from the silo root.
pub(crate) fn query_full(
  silo: &Arc<Silo>,
  query: &Query,
  context: &QueryContext,
) -> Result<Vec<Node>> {
  let root = silo
    .root_offset()
    .ok_or_else(|| Error::NotFound("no data to query".to_string()))?;
  run(silo, root, query, context)
}

/// Runs a compiled query against the children of an anchor node.
pub(crate) fn query_with_anchor(
  silo: &Arc<Silo>,
  anchor: u32,
  query: &Query,
  context: &QueryContext,
) -> Result<Vec<Node>> {
  match silo.child_offset(anchor)? {
    Some(child) => run(silo, child, query, context),
    None => Err(Error::NotFound(format!(
      "no results for XPath query '{}'",
      query.xpath()
    ))),
  }
}

fn run(
  silo: &Arc<Silo>,
  start: u32,
  query: &Query,
  context: &QueryContext,
) -> Result<Vec<Node>> {
  let flags = query.flags() | context.flags();
  let reverse = flags.contains(QueryFlags::REVERSE);
  let mut offsets: Vec<u32> = Vec::new();
  let mut seen: HashSet<u32> = HashSet::new();

  for sections in query.paths() {
    let mut walker = Walker {
      silo,
      context,
      sections,
      results: &mut offsets,
      seen: &mut seen,
      // a reversed query has to see every match before cutting down
      limit: if reverse { 0 } else { context.limit() },
    };
    walker.section_run(0, Some(start), None)?;
  }

  if reverse {
    offsets.reverse();
    if context.limit() > 0 {
      offsets.truncate(context.limit());
    }
  }

  // nothing found
  if offsets.is_empty() {
    return Err(Error::NotFound(format!(
      "no results for XPath query '{}'",
      query.xpath()
    )));
  }

  let force_cache = flags.contains(QueryFlags::FORCE_NODE_CACHE);
  Ok(
    offsets
      .into_iter()
      .map(|off| silo.create_node(off, force_cache))
      .collect(),
  )
}


struct Walker<'a> {
  silo: &'a Arc<Silo>,
  context: &'a QueryContext,
  sections: &'a [crate::query::QuerySection],
  results: &'a mut Vec<u32>,
  seen: &'a mut HashSet<u32>,
  limit: usize,
}

impl Walker<'_> {
  fn full(&self) -> bool {
    self.limit > 0 && self.results.len() >= self.limit
  }

  fn add_result(&mut self, offset: u32) {
    // `a|b` unions drop duplicates, keeping the earlier path's ordering;
    // only distinct results count toward the limit
    if self.seen.insert(offset) {
      self.results.push(offset);
    }
  }

  /// Matches one section against the sibling run starting at `start`, which
  /// may be empty. `parent` is the element that was matched one level up,
  /// needed to rewind for the `..` axis.
  fn section_run(&mut self, i: usize, start: Option<u32>, parent: Option<u32>) -> Result<()> {
    let section = &self.sections[i];
    let terminal = i + 1 == self.sections.len();

    // the parent axis steps out of the current sibling run
    if section.kind == SectionKind::Parent {
      let anchor = parent.ok_or_else(|| {
        Error::InvalidArgument("no parent set for the parent axis".to_string())
      })?;
      let grandparent = self.silo.parent_offset(anchor)?.ok_or_else(|| {
        Error::InvalidArgument(format!(
          "no parent for {}",
          self.silo.node_element(anchor).unwrap_or("?")
        ))
      })?;
      if terminal {
        self.add_result(grandparent);
        return Ok(());
      }
      // go back up and continue from the grandparent's first child
      let first = self.silo.child_offset(grandparent)?;
      return self.section_run(i + 1, first, Some(grandparent));
    }

    let mut position: u32 = 0;
    let mut offset = start;
    while let Some(off) = offset {
      if self.full() {
        break;
      }
      let record = self.silo.record(off)?;
      let matched = match section.kind {
        SectionKind::Wildcard => true,
        SectionKind::Element => {
          // an element name the silo never interned can match nothing
          if section.element_idx != UNSET && record.element_name() == section.element_idx {
            position += 1;
            let mut ok = true;
            for predicate in &section.predicates {
              let query_data = QueryData {
                offset: off,
                position,
              };
              if !run_predicate(self.silo, predicate, query_data, self.context)? {
                ok = false;
                break;
              }
            }
            ok
          } else {
            false
          }
        }
        SectionKind::Parent => unreachable!("handled above"),
      };
      if matched {
        if terminal {
          self.add_result(off);
        } else {
          let child = self.silo.child_offset(off)?;
          self.section_run(i + 1, child, Some(off))?;
        }
      }
      offset = match record.next() {
        0 => None,
        next => Some(next),
      };
    }
    Ok(())
  }
}
