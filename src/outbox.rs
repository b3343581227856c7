use core::fmt::Debug;

use heapless::Vec;

/// Bounded list of commands produced by one state machine step.
///
/// Capacities are sized for the longest step each machine can take, so an
/// overflow is a programming error; it is logged and the command dropped.
#[derive(Debug)]
pub struct Outbox<C, const N: usize> {
    commands: Vec<C, N>,
}

impl<C: Debug, const N: usize> Outbox<C, N> {
    pub const fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: C) {
        if let Err(command) = self.commands.push(command) {
            log::error!("Command outbox full, dropping {command:?}");
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, C> {
        self.commands.iter()
    }

    pub fn as_slice(&self) -> &[C] {
        &self.commands
    }
}

impl<C: Debug, const N: usize> Default for Outbox<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, const N: usize> IntoIterator for Outbox<C, N> {
    type Item = C;
    type IntoIter = <Vec<C, N> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_newest_command() {
        let mut outbox: Outbox<u8, 2> = Outbox::new();
        outbox.push(1);
        outbox.push(2);
        outbox.push(3);
        assert_eq!(outbox.as_slice(), &[1, 2]);
    }
}
