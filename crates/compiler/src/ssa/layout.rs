//! Block layout for structured control-flow reconstruction.
//!
//! Blocks are ordered reverse-postorder with successor 0 visited first,
//! so a two-way block's then-chain precedes its else-chain and loop
//! bodies stay contiguous after their headers. A block with an incoming
//! edge from a later block in this order is a loop header.

use super::{BlockId, Func};
use std::collections::HashSet;

pub fn layout(f: &mut Func) {
    let mut po = f.postorder();
    po.reverse();
    f.layout = po;
}

/// Blocks that are the target of a back edge under the current layout.
pub fn loop_headers(f: &Func) -> HashSet<BlockId> {
    let mut index = vec![usize::MAX; f.blocks.len()];
    for (i, &b) in f.layout.iter().enumerate() {
        index[b.0 as usize] = i;
    }
    let mut headers = HashSet::new();
    for &b in &f.layout {
        let bi = index[b.0 as usize];
        for e in &f.blk(b).preds {
            let pi = index[e.block.0 as usize];
            if pi != usize::MAX && pi >= bi {
                headers.insert(b);
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::BlockKind;
    use crate::types::TypeIndex;

    #[test]
    fn test_loop_header_detection() {
        // entry -> header; header -> body | exit; body -> header
        let mut f = Func::new("t", TypeIndex::I64, false);
        let header = f.add_block(BlockKind::If);
        let body = f.add_block(BlockKind::Plain);
        let exit = f.add_block(BlockKind::Ret);
        f.add_edge(f.entry, header);
        f.add_edge(header, body);
        f.add_edge(header, exit);
        f.add_edge(body, header);
        layout(&mut f);
        let headers = loop_headers(&f);
        assert!(headers.contains(&header));
        assert!(!headers.contains(&body));
        assert!(!headers.contains(&exit));
        // Body is laid out before the exit.
        let pos = |b| f.layout.iter().position(|&x| x == b).unwrap();
        assert!(pos(header) < pos(body));
        assert!(pos(body) < pos(exit));
    }

    #[test]
    fn test_straight_line_has_no_headers() {
        let mut f = Func::new("t", TypeIndex::I64, false);
        let b = f.add_block(BlockKind::Ret);
        f.add_edge(f.entry, b);
        layout(&mut f);
        assert!(loop_headers(&f).is_empty());
    }
}
