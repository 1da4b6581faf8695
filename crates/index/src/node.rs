//! Index tree nodes
//!
//! The index is a copy-on-write B-tree mapping keys to version lists. A
//! node is either in memory (freshly written, not yet flushed) or on disk,
//! addressed by its global offset in the node log. Inner children carry the
//! maximum key of their subtree, so routing never loads a child just to
//! decide direction.
//!
//! # Node Layout
//!
//! ```text
//! leaf:  0x00 | nentries (4) | entry*
//! entry: key_len (2) | key | nversions (4) | version*
//! version: tx_id (8) | value_ref (16) | meta (1)
//!
//! inner: 0x01 | nchildren (4) | child*
//! child: key_len (2) | max_key | offset (8)
//! ```
//!
//! An inner node can only be serialized once all its children are on disk;
//! flushing therefore walks bottom-up.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use veri_core::{EntryMeta, Error, Key, Result, TxId, ValueRef};

const LEAF_TAG: u8 = 0x00;
const INNER_TAG: u8 = 0x01;

/// One version of a key: the transaction that wrote it and where the value
/// lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Transaction that wrote this version.
    pub tx_id: TxId,
    /// Value location in the value log.
    pub value_ref: ValueRef,
    /// Entry metadata (deletion marker).
    pub meta: EntryMeta,
}

/// A key with its full version history, ascending by transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// The key.
    pub key: Key,
    /// Versions, ascending by `tx_id`. Never empty.
    pub versions: Vec<Version>,
}

impl LeafEntry {
    /// Latest version with `tx_id <= up_to`, if any.
    pub fn version_at(&self, up_to: TxId) -> Option<&Version> {
        self.versions.iter().rev().find(|v| v.tx_id <= up_to)
    }
}

/// Reference to a child node: resident or at an offset in the node log.
#[derive(Debug, Clone)]
pub enum ChildRef {
    /// Node held in memory, not yet flushed.
    Mem(Arc<Node>),
    /// Node at a global offset in the node log.
    Disk(u64),
}

/// Inner-node slot: subtree reference plus its maximum key.
#[derive(Debug, Clone)]
pub struct InnerChild {
    /// Largest key in the subtree.
    pub max_key: Key,
    /// The subtree.
    pub child: ChildRef,
}

/// One node of the index tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// Leaf: sorted keys with version histories.
    Leaf(Vec<LeafEntry>),
    /// Inner: sorted child slots.
    Inner(Vec<InnerChild>),
}

impl Node {
    /// Number of entries or children.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Inner(children) => children.len(),
        }
    }

    /// Whether the node holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest key in the subtree rooted at this node.
    ///
    /// Nodes are never empty except for the root of an empty tree.
    pub fn max_key(&self) -> Option<&Key> {
        match self {
            Node::Leaf(entries) => entries.last().map(|e| &e.key),
            Node::Inner(children) => children.last().map(|c| &c.max_key),
        }
    }

    /// Serialize for the node log.
    ///
    /// Fails if any inner child is still memory-resident.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Node::Leaf(entries) => {
                buf.write_u8(LEAF_TAG)?;
                buf.write_u32::<LittleEndian>(entries.len() as u32)?;
                for entry in entries {
                    let key = entry.key.as_bytes();
                    buf.write_u16::<LittleEndian>(key.len() as u16)?;
                    buf.extend_from_slice(key);
                    buf.write_u32::<LittleEndian>(entry.versions.len() as u32)?;
                    for v in &entry.versions {
                        buf.write_u64::<LittleEndian>(v.tx_id)?;
                        buf.extend_from_slice(&v.value_ref.to_bytes());
                        buf.write_u8(v.meta.as_byte())?;
                    }
                }
            }
            Node::Inner(children) => {
                buf.write_u8(INNER_TAG)?;
                buf.write_u32::<LittleEndian>(children.len() as u32)?;
                for child in children {
                    let offset = match child.child {
                        ChildRef::Disk(offset) => offset,
                        ChildRef::Mem(_) => {
                            return Err(Error::Corrupted(
                                "serializing inner node with resident child".into(),
                            ))
                        }
                    };
                    let key = child.max_key.as_bytes();
                    buf.write_u16::<LittleEndian>(key.len() as u16)?;
                    buf.extend_from_slice(key);
                    buf.write_u64::<LittleEndian>(offset)?;
                }
            }
        }
        Ok(buf)
    }

    /// Deserialize from a node-log record.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| Error::Corrupted(format!("truncated index node: {}", what));

        let mut cur = Cursor::new(payload);
        let tag = cur.read_u8().map_err(|_| corrupt("tag"))?;
        match tag {
            LEAF_TAG => {
                let n = cur
                    .read_u32::<LittleEndian>()
                    .map_err(|_| corrupt("entry count"))? as usize;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    let key = read_key(&mut cur, payload).map_err(|_| corrupt("key"))?;
                    let nv = cur
                        .read_u32::<LittleEndian>()
                        .map_err(|_| corrupt("version count"))? as usize;
                    let mut versions = Vec::with_capacity(nv);
                    for _ in 0..nv {
                        let tx_id = cur
                            .read_u64::<LittleEndian>()
                            .map_err(|_| corrupt("version tx id"))?;
                        let mut vref = [0u8; 16];
                        std::io::Read::read_exact(&mut cur, &mut vref)
                            .map_err(|_| corrupt("value reference"))?;
                        let meta =
                            EntryMeta::from_byte(cur.read_u8().map_err(|_| corrupt("meta"))?);
                        versions.push(Version {
                            tx_id,
                            value_ref: ValueRef::from_bytes(&vref),
                            meta,
                        });
                    }
                    entries.push(LeafEntry { key, versions });
                }
                Ok(Node::Leaf(entries))
            }
            INNER_TAG => {
                let n = cur
                    .read_u32::<LittleEndian>()
                    .map_err(|_| corrupt("child count"))? as usize;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    let max_key = read_key(&mut cur, payload).map_err(|_| corrupt("max key"))?;
                    let offset = cur
                        .read_u64::<LittleEndian>()
                        .map_err(|_| corrupt("child offset"))?;
                    children.push(InnerChild {
                        max_key,
                        child: ChildRef::Disk(offset),
                    });
                }
                Ok(Node::Inner(children))
            }
            _ => Err(Error::Corrupted(format!("unknown index node tag {}", tag))),
        }
    }
}

fn read_key(cur: &mut Cursor<&[u8]>, payload: &[u8]) -> std::io::Result<Key> {
    let len = cur.read_u16::<LittleEndian>()? as usize;
    let pos = cur.position() as usize;
    let end = pos + len;
    if end > payload.len() {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
    }
    let key = Key::from(&payload[pos..end]);
    cur.set_position(end as u64);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(tx_id: TxId) -> Version {
        Version {
            tx_id,
            value_ref: ValueRef {
                segment: 1,
                offset: tx_id * 10,
                len: 5,
            },
            meta: EntryMeta::none(),
        }
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = Node::Leaf(vec![
            LeafEntry {
                key: Key::from("alpha"),
                versions: vec![version(1), version(4)],
            },
            LeafEntry {
                key: Key::from("beta"),
                versions: vec![version(2)],
            },
        ]);
        let bytes = node.to_bytes().unwrap();
        match Node::from_bytes(&bytes).unwrap() {
            Node::Leaf(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].versions, vec![version(1), version(4)]);
                assert_eq!(entries[1].key, Key::from("beta"));
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_inner_roundtrip() {
        let node = Node::Inner(vec![
            InnerChild {
                max_key: Key::from("m"),
                child: ChildRef::Disk(100),
            },
            InnerChild {
                max_key: Key::from("z"),
                child: ChildRef::Disk(200),
            },
        ]);
        let bytes = node.to_bytes().unwrap();
        match Node::from_bytes(&bytes).unwrap() {
            Node::Inner(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1].child, ChildRef::Disk(200)));
            }
            _ => panic!("expected inner"),
        }
    }

    #[test]
    fn test_inner_with_resident_child_rejected() {
        let node = Node::Inner(vec![InnerChild {
            max_key: Key::from("x"),
            child: ChildRef::Mem(Arc::new(Node::Leaf(vec![]))),
        }]);
        assert!(node.to_bytes().is_err());
    }

    #[test]
    fn test_version_at_picks_latest_visible() {
        let entry = LeafEntry {
            key: Key::from("k"),
            versions: vec![version(2), version(5), version(9)],
        };
        assert_eq!(entry.version_at(1), None);
        assert_eq!(entry.version_at(5).unwrap().tx_id, 5);
        assert_eq!(entry.version_at(7).unwrap().tx_id, 5);
        assert_eq!(entry.version_at(100).unwrap().tx_id, 9);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Node::from_bytes(&[]).is_err());
        assert!(Node::from_bytes(&[7, 0, 0, 0, 0]).is_err());
        let node = Node::Leaf(vec![LeafEntry {
            key: Key::from("k"),
            versions: vec![version(1)],
        }]);
        let bytes = node.to_bytes().unwrap();
        assert!(Node::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
