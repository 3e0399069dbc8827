use std::fmt;
use wasession_binary::node::{Attrs, Node, NodeContent};

/// Compact XML-like rendering of a node for logs.
pub struct DisplayableNode<'a>(pub &'a Node);

fn get_printable_str(data: &[u8]) -> Option<&str> {
    let s = std::str::from_utf8(data).ok()?;
    s.chars().all(|c| !c.is_control()).then_some(s)
}

fn format_attributes(attrs: &Attrs) -> String {
    let mut keys: Vec<_> = attrs.keys().collect();
    keys.sort_unstable();

    let mut result = String::new();
    for key in keys {
        if let Some(value) = attrs.get(key) {
            result.push_str(&format!(" {key}=\"{value}\""));
        }
    }
    result
}

impl<'a> fmt::Display for DisplayableNode<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.0;
        let attrs = format_attributes(&node.attrs);
        match &node.content {
            None => write!(f, "<{}{}/>", node.tag, attrs),
            Some(NodeContent::Nodes(nodes)) => {
                write!(f, "<{}{}>", node.tag, attrs)?;
                for child in nodes {
                    write!(f, "{}", DisplayableNode(child))?;
                }
                write!(f, "</{}>", node.tag)
            }
            Some(NodeContent::String(s)) => {
                write!(f, "<{}{}>{}</{}>", node.tag, attrs, s.replace('\n', "\\n"), node.tag)
            }
            Some(NodeContent::Bytes(bytes)) => match get_printable_str(bytes) {
                Some(s) => write!(f, "<{}{}>{}</{}>", node.tag, attrs, s, node.tag),
                None => write!(
                    f,
                    "<{}{}><!-- {} bytes --></{}>",
                    node.tag,
                    attrs,
                    bytes.len(),
                    node.tag
                ),
            },
        }
    }
}
