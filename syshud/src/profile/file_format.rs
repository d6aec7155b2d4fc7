//! Saving and loading profiles
//!
//! The file is line-oriented tagged markup, one element per line, nested
//! elements indented by four spaces:
//!
//! ```text
//! <profile>
//!     <size>8</size>
//!     <objects>
//!         <object id="1">
//!             <name>"[Everything]"</name>
//!             <total>8</total>
//!             <self>0</self>
//!         </object>
//!     </objects>
//!     <nodes>
//!         <node id="2">
//!             <object>1</object>
//!             <siblings>0</siblings>
//!             <children>3</children>
//!             <parent>0</parent>
//!             <next>0</next>
//!             <total>8</total>
//!             <self>0</self>
//!             <toplevel>1</toplevel>
//!         </node>
//!     </nodes>
//! </profile>
//! ```
//!
//! Ids are unique across the whole file and `0` is the null reference.
//! Loading rebuilds the tree from each node's path to its root and self
//! weight, so node ids need not survive a round trip; the tree shape and
//! weights do.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::warn;

use super::{Profile, SymbolTable};
use crate::domain::{ProfileFileError, SymbolId};
use crate::stackstash::{NodeId, StackStash};

/// Write `profile` to `path`
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn save_profile(profile: &Profile, path: &Path) -> Result<(), ProfileFileError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_profile(profile, &mut out)?;
    out.flush()?;
    Ok(())
}

/// Read a profile previously written by [`save_profile`]
///
/// # Errors
/// Returns an error if the file cannot be read or is not a valid profile.
pub fn load_profile(path: &Path) -> Result<Profile, ProfileFileError> {
    read_profile(BufReader::new(File::open(path)?))
}

struct Writer<'a, W> {
    out: &'a mut W,
    depth: usize,
}

impl<W: Write> Writer<'_, W> {
    fn indent(&mut self) -> io::Result<()> {
        for _ in 0..self.depth {
            self.out.write_all(b"    ")?;
        }
        Ok(())
    }

    fn open(&mut self, tag: &str, id: Option<u64>) -> io::Result<()> {
        self.indent()?;
        match id {
            Some(id) => writeln!(self.out, "<{tag} id=\"{id}\">")?,
            None => writeln!(self.out, "<{tag}>")?,
        }
        self.depth += 1;
        Ok(())
    }

    fn close(&mut self, tag: &str) -> io::Result<()> {
        self.depth -= 1;
        self.indent()?;
        writeln!(self.out, "</{tag}>")
    }

    fn value(&mut self, tag: &str, value: impl std::fmt::Display) -> io::Result<()> {
        self.indent()?;
        writeln!(self.out, "<{tag}>{value}</{tag}>")
    }
}

fn object_ref(id: SymbolId) -> u64 {
    u64::from(id.0) + 1
}

/// Serialize `profile` into `out`
///
/// # Errors
/// Propagates write errors from `out`.
pub fn write_profile<W: Write>(profile: &Profile, out: &mut W) -> io::Result<()> {
    let stash = profile.stash();
    let symbols = profile.symbols();
    let n_objects = symbols.len() as u64;
    let node_ref = |id: Option<NodeId>| id.map_or(0, |id| n_objects + id.index() as u64 + 1);

    let mut w = Writer { out, depth: 0 };
    w.open("profile", None)?;
    w.value("size", profile.size())?;

    w.open("objects", None)?;
    let mut weights: HashMap<SymbolId, (u64, u64)> = HashMap::new();
    stash.foreach_by_address(|id, self_weight, total| {
        weights.insert(id, (self_weight, total));
    });
    for (id, name) in symbols.iter() {
        let (self_weight, total) = weights.get(&id).copied().unwrap_or_default();
        w.open("object", Some(object_ref(id)))?;
        w.value("name", quote(name))?;
        w.value("total", total)?;
        w.value("self", self_weight)?;
        w.close("object")?;
    }
    w.close("objects")?;

    w.open("nodes", None)?;
    for id in stash.node_ids() {
        let node = stash.node(id);
        w.open("node", Some(node_ref(Some(id))))?;
        w.value("object", object_ref(node.data()))?;
        w.value("siblings", node_ref(node.next_sibling()))?;
        w.value("children", node_ref(node.first_child()))?;
        w.value("parent", node_ref(node.parent()))?;
        w.value("next", node_ref(node.next_same_data()))?;
        w.value("total", stash.compute_total(id))?;
        w.value("self", node.size())?;
        w.value("toplevel", u8::from(node.is_toplevel()))?;
        w.close("node")?;
    }
    w.close("nodes")?;

    w.close("profile")
}

fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            '&' => quoted.push_str("&amp;"),
            '<' => quoted.push_str("&lt;"),
            '>' => quoted.push_str("&gt;"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            '&' => {
                let entity: String = chars.by_ref().take_while(|&c| c != ';').collect();
                out.push(match entity.as_str() {
                    "amp" => '&',
                    "lt" => '<',
                    "gt" => '>',
                    "quot" => '"',
                    "apos" => '\'',
                    _ => return None,
                });
            }
            c => out.push(c),
        }
    }
    Some(out)
}

/// One parsed line
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Open { tag: &'a str, id: Option<u64> },
    Close(&'a str),
    Value { tag: &'a str, value: &'a str },
}

fn parse_line(line: &str) -> Option<Line<'_>> {
    let line = line.trim();
    if let Some(tag) = line.strip_prefix("</") {
        return Some(Line::Close(tag.strip_suffix('>')?));
    }

    let rest = line.strip_prefix('<')?;
    let end = rest.find('>')?;
    let (head, after) = (&rest[..end], &rest[end + 1..]);

    if after.is_empty() {
        return match head.split_once(' ') {
            Some((tag, attr)) => {
                let id = attr.strip_prefix("id=\"")?.strip_suffix('"')?.parse().ok()?;
                Some(Line::Open { tag, id: Some(id) })
            }
            None => Some(Line::Open { tag: head, id: None }),
        };
    }

    let value = after.strip_suffix('>')?.strip_suffix(head)?.strip_suffix("</")?;
    Some(Line::Value { tag: head, value })
}

#[derive(Debug, Default)]
struct RawNode {
    object: Option<u64>,
    parent: Option<u64>,
    children: Option<u64>,
    self_weight: Option<u64>,
}

#[derive(Debug, Default)]
struct RawProfile {
    size: Option<u64>,
    objects: Vec<(u64, String)>,
    nodes: Vec<(u64, RawNode)>,
}

/// Parse a profile from `input`
///
/// # Errors
/// Returns an error on I/O failure, malformed lines, missing fields,
/// references to unknown ids, or a parent chain that loops.
pub fn read_profile<R: BufRead>(input: R) -> Result<Profile, ProfileFileError> {
    let raw = parse_document(input)?;
    rebuild(raw)
}

fn parse_document<R: BufRead>(input: R) -> Result<RawProfile, ProfileFileError> {
    let mut raw = RawProfile::default();
    let mut stack: Vec<(String, Option<u64>)> = Vec::new();
    let mut name: Option<String> = None;
    let mut node = RawNode::default();

    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let syntax = |message: String| ProfileFileError::Syntax { line: line_no, message };
        let number = |value: &str| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| syntax(format!("expected a number, got {value:?}")))
        };

        match parse_line(&line).ok_or_else(|| syntax(format!("cannot parse {:?}", line.trim())))? {
            Line::Open { tag, id } => {
                if matches!(tag, "object" | "node") && id.is_none() {
                    return Err(syntax(format!("<{tag}> without an id")));
                }
                stack.push((tag.to_string(), id));
            }
            Line::Close(tag) => {
                let Some((open, id)) = stack.pop() else {
                    return Err(syntax(format!("unexpected </{tag}>")));
                };
                if open != tag {
                    return Err(syntax(format!("</{tag}> closes <{open}>")));
                }
                match (tag, id) {
                    ("object", Some(id)) => {
                        let name = name.take().ok_or(ProfileFileError::MissingField("name"))?;
                        raw.objects.push((id, name));
                    }
                    ("node", Some(id)) => raw.nodes.push((id, std::mem::take(&mut node))),
                    _ => {}
                }
            }
            Line::Value { tag, value } => {
                let parent = stack.last().map(|(t, _)| t.as_str());
                match (parent, tag) {
                    (Some("profile"), "size") => raw.size = Some(number(value)?),
                    (Some("object"), "name") => {
                        let unquoted = unquote(value)
                            .ok_or_else(|| syntax(format!("bad string {value}")))?;
                        name = Some(unquoted);
                    }
                    (Some("node"), "object") => node.object = Some(number(value)?),
                    (Some("node"), "parent") => node.parent = Some(number(value)?),
                    (Some("node"), "children") => node.children = Some(number(value)?),
                    (Some("node"), "self") => node.self_weight = Some(number(value)?),
                    // Recomputed on load
                    (Some("object" | "node"), _) => {}
                    (_, tag) => return Err(syntax(format!("unexpected <{tag}>"))),
                }
            }
        }
    }

    if let Some((tag, _)) = stack.pop() {
        return Err(ProfileFileError::Syntax { line: 0, message: format!("unclosed <{tag}>") });
    }
    Ok(raw)
}

/// A node with its object resolved to a symbol
struct ResolvedNode {
    symbol: SymbolId,
    parent: u64,
    has_children: bool,
    self_weight: u64,
}

fn rebuild(raw: RawProfile) -> Result<Profile, ProfileFileError> {
    let mut symbols = SymbolTable::new();
    let mut object_symbols: HashMap<u64, SymbolId> = HashMap::new();
    for (id, name) in &raw.objects {
        object_symbols.insert(*id, symbols.intern(name));
    }

    let mut nodes: HashMap<u64, ResolvedNode> = HashMap::with_capacity(raw.nodes.len());
    let mut order = Vec::with_capacity(raw.nodes.len());
    for (id, node) in raw.nodes {
        let object = node.object.ok_or(ProfileFileError::MissingField("object"))?;
        let symbol = *object_symbols
            .get(&object)
            .ok_or(ProfileFileError::DanglingReference { node: id, kind: "object", id: object })?;
        nodes.insert(
            id,
            ResolvedNode {
                symbol,
                parent: node.parent.ok_or(ProfileFileError::MissingField("parent"))?,
                has_children: node.children.ok_or(ProfileFileError::MissingField("children"))? != 0,
                self_weight: node.self_weight.ok_or(ProfileFileError::MissingField("self"))?,
            },
        );
        order.push(id);
    }

    let mut stash = StackStash::new();
    let mut path: Vec<SymbolId> = Vec::new();
    let mut visited: HashSet<u64> = HashSet::new();

    for id in order {
        let node = &nodes[&id];
        // Interior nodes without weight are recreated by their descendants
        if node.self_weight == 0 && node.has_children {
            continue;
        }

        path.clear();
        visited.clear();
        let mut cursor = id;
        while cursor != 0 {
            if !visited.insert(cursor) {
                return Err(ProfileFileError::ParentCycle(id));
            }
            let current = nodes
                .get(&cursor)
                .ok_or(ProfileFileError::DanglingReference {
                    node: id,
                    kind: "parent",
                    id: cursor,
                })?;
            path.push(current.symbol);
            cursor = current.parent;
        }
        path.reverse();
        stash.add_trace(&path, node.self_weight);
    }

    if let Some(size) = raw.size {
        if size != stash.total_weight() {
            warn!("Profile claims size {size} but its nodes add up to {}", stash.total_weight());
        }
    }

    Ok(Profile::new(symbols, stash))
}
