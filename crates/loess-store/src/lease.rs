//! Lease handles over cached nodes.

use loess_common::Result;
use loess_node::Node;
use std::cell::RefCell;
use std::rc::Rc;

/// Callback invoked exactly once when a lease is released.
pub type ReleaseFn<'a> = Box<dyn FnOnce(u32) -> Result<()> + 'a>;

/// A lease on a node from some block. It tracks how long the node is in
/// use: the release callback runs exactly once, either through an explicit
/// [`close`](Lease::close) or on drop. After `close` the lease is gone, so
/// a double release is impossible.
pub struct Lease<'a> {
    node: Rc<RefCell<Node>>,
    block: u32,
    release: Option<ReleaseFn<'a>>,
}

impl<'a> std::fmt::Debug for Lease<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("node", &self.node)
            .field("block", &self.block)
            .finish()
    }
}

impl<'a> Lease<'a> {
    /// Constructs a lease for a node and block that will run the callback
    /// when released.
    pub fn new(node: Rc<RefCell<Node>>, block: u32, release: ReleaseFn<'a>) -> Lease<'a> {
        Lease {
            node,
            block,
            release: Some(release),
        }
    }

    /// Returns the node the lease holds.
    pub fn node(&self) -> &Rc<RefCell<Node>> {
        &self.node
    }

    /// Returns the block number the node was retrieved with.
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Releases the lease, surfacing any error from the release path.
    pub fn close(mut self) -> Result<()> {
        match self.release.take() {
            Some(release) => release(self.block),
            None => Ok(()),
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(err) = release(self.block) {
                tracing::warn!(block = self.block, error = %err, "lease release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loess_common::LoessError;
    use std::cell::Cell;

    fn test_node() -> Rc<RefCell<Node>> {
        Rc::new(RefCell::new(Node::new(0, 0)))
    }

    #[test]
    fn test_lease_close_releases_once() {
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();

        let lease = Lease::new(test_node(), 3, Box::new(move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        }));
        assert_eq!(lease.block(), 3);

        lease.close().unwrap();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_lease_drop_releases_once() {
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();

        {
            let _lease = Lease::new(test_node(), 4, Box::new(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            }));
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_lease_close_surfaces_errors() {
        let lease = Lease::new(
            test_node(),
            5,
            Box::new(|block| Err(LoessError::contract(format!("release of {block}")))),
        );
        let err = lease.close().unwrap_err();
        assert!(err.to_string().contains("release of 5"));
    }

    #[test]
    fn test_lease_node_access() {
        let node = test_node();
        let lease = Lease::new(node.clone(), 6, Box::new(|_| Ok(())));

        lease.node().borrow_mut().insert(b"key", b"value");
        lease.close().unwrap();

        assert_eq!(node.borrow().count(), 1);
    }
}
