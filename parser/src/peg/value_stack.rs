use std::{fmt::Debug, rc::Rc};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueStackError {
    #[error("value stack underflow: depth {depth} requested with {size} values on the stack")]
    Underflow { depth: usize, size: usize },
}

type Link<V> = Option<Rc<Element<V>>>;

struct Element<V> {
    value: V,
    tail: Link<V>,
}

/// Persistent stack of values produced by grammar actions.
///
/// Frames are shared between the live stack and any snapshot taken earlier,
/// and are never mutated once linked in, so taking and restoring a
/// snapshot only copies the head pointer.
pub struct ValueStack<V> {
    head: Link<V>,
    size: usize,
}

/// Opaque head reference returned by `ValueStack::take_snapshot()`.
pub struct ValueStackSnapshot<V> {
    head: Link<V>,
    size: usize,
}

impl<V> Clone for ValueStack<V> {
    fn clone(&self) -> Self {
        ValueStack {
            head: self.head.clone(),
            size: self.size,
        }
    }
}

impl<V> Clone for ValueStackSnapshot<V> {
    fn clone(&self) -> Self {
        ValueStackSnapshot {
            head: self.head.clone(),
            size: self.size,
        }
    }
}

impl<V> Default for ValueStack<V> {
    fn default() -> Self {
        ValueStack {
            head: None,
            size: 0,
        }
    }
}

impl<V: Debug> Debug for ValueStack<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<V> ValueStack<V> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn clear(&mut self) {
        self.head = None;
        self.size = 0;
    }

    #[inline(always)]
    pub fn take_snapshot(&self) -> ValueStackSnapshot<V> {
        ValueStackSnapshot {
            head: self.head.clone(),
            size: self.size,
        }
    }

    #[inline(always)]
    pub fn restore_snapshot(&mut self, snapshot: ValueStackSnapshot<V>) {
        self.head = snapshot.head;
        self.size = snapshot.size;
    }

    pub fn push(&mut self, value: V) {
        let tail = self.head.take();
        self.head = Some(Rc::new(Element { value, tail }));
        self.size += 1;
    }

    /// Iterates from the top of the stack downwards.
    pub fn iter(&self) -> impl Iterator<Item = &V> + '_ {
        let mut curr = self.head.as_deref();
        std::iter::from_fn(move || {
            let e = curr?;
            curr = e.tail.as_deref();
            Some(&e.value)
        })
    }

    fn check_depth(&self, depth: usize) -> Result<(), ValueStackError> {
        if depth >= self.size {
            Err(ValueStackError::Underflow {
                depth,
                size: self.size,
            })
        } else {
            Ok(())
        }
    }

    pub fn peek(&self) -> Result<&V, ValueStackError> {
        self.peek_at(0)
    }

    pub fn peek_at(&self, down: usize) -> Result<&V, ValueStackError> {
        self.iter().nth(down).ok_or(ValueStackError::Underflow {
            depth: down,
            size: self.size,
        })
    }
}

impl<V: Clone> ValueStack<V> {
    pub fn from_values(values: impl IntoIterator<Item = V>) -> Self {
        let mut r = Self::new();
        for v in values {
            r.push(v);
        }
        r
    }

    // Detach the top `n` values, returning them top first, and leave the
    // remaining chain as the new head. Shared frames are copied, not moved.
    fn split_top(&mut self, n: usize) -> Vec<V> {
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            let elt = self.head.take().expect("depth checked");
            let (value, tail) = match Rc::try_unwrap(elt) {
                Ok(elt) => (elt.value, elt.tail),
                Err(shared) => (shared.value.clone(), shared.tail.clone()),
            };
            taken.push(value);
            self.head = tail;
            self.size -= 1;
        }
        taken
    }

    fn push_back(&mut self, values: Vec<V>) {
        for v in values.into_iter().rev() {
            self.push(v);
        }
    }

    /// Inserts `value` below the top `down` values.
    pub fn push_at(&mut self, down: usize, value: V) -> Result<(), ValueStackError> {
        if down > self.size {
            return Err(ValueStackError::Underflow {
                depth: down,
                size: self.size,
            });
        }
        let above = self.split_top(down);
        self.push(value);
        self.push_back(above);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<V, ValueStackError> {
        self.pop_at(0)
    }

    /// Removes and returns the value `down` positions below the top.
    pub fn pop_at(&mut self, down: usize) -> Result<V, ValueStackError> {
        self.check_depth(down)?;
        let mut above = self.split_top(down + 1);
        let value = above.pop().expect("depth checked");
        self.push_back(above);
        Ok(value)
    }

    pub fn poke(&mut self, value: V) -> Result<(), ValueStackError> {
        self.poke_at(0, value)
    }

    /// Replaces the value `down` positions below the top.
    pub fn poke_at(&mut self, down: usize, value: V) -> Result<(), ValueStackError> {
        self.check_depth(down)?;
        let mut above = self.split_top(down + 1);
        above.pop();
        self.push(value);
        self.push_back(above);
        Ok(())
    }

    pub fn dup(&mut self) -> Result<(), ValueStackError> {
        let top = self.peek()?.clone();
        self.push(top);
        Ok(())
    }

    /// Reverses the order of the top `n` values.
    pub fn swap_n(&mut self, n: usize) -> Result<(), ValueStackError> {
        if n < 2 {
            return Ok(());
        }
        self.check_depth(n - 1)?;
        let top = self.split_top(n);
        for v in top {
            self.push(v);
        }
        Ok(())
    }

    pub fn swap(&mut self) -> Result<(), ValueStackError> {
        self.swap_n(2)
    }

    pub fn swap3(&mut self) -> Result<(), ValueStackError> {
        self.swap_n(3)
    }

    pub fn swap4(&mut self) -> Result<(), ValueStackError> {
        self.swap_n(4)
    }

    pub fn swap5(&mut self) -> Result<(), ValueStackError> {
        self.swap_n(5)
    }

    pub fn swap6(&mut self) -> Result<(), ValueStackError> {
        self.swap_n(6)
    }

    /// Values from the bottom of the stack up.
    pub fn to_vec(&self) -> Vec<V> {
        let mut r: Vec<V> = self.iter().cloned().collect();
        r.reverse();
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(values: &[i32]) -> ValueStack<i32> {
        ValueStack::from_values(values.iter().copied())
    }

    #[test]
    fn test_push_pop_peek() {
        let mut s = stack(&[1, 2, 3]);
        assert_eq!(s.len(), 3);
        assert_eq!(*s.peek().unwrap(), 3);
        assert_eq!(*s.peek_at(2).unwrap(), 1);
        assert_eq!(
            s.peek_at(3),
            Err(ValueStackError::Underflow { depth: 3, size: 3 })
        );
        assert_eq!(s.pop_at(1).unwrap(), 2);
        assert_eq!(s.to_vec(), vec![1, 3]);
        s.push_at(2, 0).unwrap();
        assert_eq!(s.to_vec(), vec![0, 1, 3]);
        assert!(s.push_at(4, 9).is_err());
        s.poke_at(1, 7).unwrap();
        assert_eq!(s.to_vec(), vec![0, 7, 3]);
        s.dup().unwrap();
        assert_eq!(s.to_vec(), vec![0, 7, 3, 3]);
        assert_eq!(s.pop().unwrap(), 3);
        assert_eq!(s.pop().unwrap(), 3);
        assert_eq!(s.pop().unwrap(), 7);
        assert_eq!(s.pop().unwrap(), 0);
        assert!(s.pop().is_err());
        assert!(s.dup().is_err());
        assert!(s.poke(1).is_err());
    }

    #[test]
    fn test_swaps() {
        let mut s = stack(&[1, 2, 3, 4, 5, 6, 7]);
        s.swap().unwrap();
        assert_eq!(s.to_vec(), vec![1, 2, 3, 4, 5, 7, 6]);
        s.swap3().unwrap();
        assert_eq!(s.to_vec(), vec![1, 2, 3, 4, 6, 7, 5]);
        s.swap6().unwrap();
        assert_eq!(s.to_vec(), vec![1, 5, 7, 6, 4, 3, 2]);
        let mut short = stack(&[1, 2, 3]);
        assert_eq!(
            short.swap4(),
            Err(ValueStackError::Underflow { depth: 3, size: 3 })
        );
        assert_eq!(short.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut s = stack(&[1, 2]);
        let snap = s.take_snapshot();
        s.restore_snapshot(s.take_snapshot());
        assert_eq!(s.to_vec(), vec![1, 2]);

        s.push(3);
        s.swap3().unwrap();
        s.poke_at(2, 10).unwrap();
        assert_eq!(s.to_vec(), vec![10, 2, 1]);
        let later = s.take_snapshot();
        s.pop().unwrap();
        s.pop().unwrap();

        s.restore_snapshot(snap.clone());
        assert_eq!(s.to_vec(), vec![1, 2]);
        s.restore_snapshot(later);
        assert_eq!(s.to_vec(), vec![10, 2, 1]);
        s.restore_snapshot(snap);
        assert_eq!(s.len(), 2);
        assert_eq!(*s.peek().unwrap(), 2);
    }
}
