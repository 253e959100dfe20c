//! Instrumented single-threaded model of the decoupled lookback.
//!
//! Partitions are simulated as actors that take one atomic action per
//! scheduling step, driven by the same [`LookbackWalker`], [`Poller`] and
//! [`publish`] the kernels use. A schedule is a list of choices; each
//! choice picks among the actors that can move (started and unfinished,
//! plus "start the next ticket"). Every cell access is checked as it
//! happens:
//!
//! - cell flags only ever advance;
//! - a walking partition only reads rows of its predecessors;
//! - every published aggregate or inclusive value is the true one;
//! - an inclusive prefix is only published by its owner after its walk resolved;
//! - the resolved exclusive prefixes equal a sequential scan.

use std::cell::{Cell, RefCell};

use super::lookback::{
    pack, publish, unpack, CellFlag, LookbackWalker, Poller, SpinPolicy, StallAction,
    StatusCells, WalkStep,
};

/// An invariant broken during a simulated run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelViolation {
    #[error("cell {index} moved from {from:?} to {to:?}")]
    NonMonotonic {
        index: usize,
        from: CellFlag,
        to: CellFlag,
    },
    #[error("partition {observer} read row {row}, which is not a predecessor row")]
    ObservedSuccessor { observer: u32, row: usize },
    #[error("cell {index} carries {observed} but the true value is {expected}")]
    WrongValue {
        index: usize,
        observed: u32,
        expected: u32,
    },
    #[error("inclusive prefix written to cell {index} without a resolved walk by its owner")]
    PrematureInclusive { index: usize },
    #[error("partition {partition} column {column} resolved {got}, expected {expected}")]
    WrongExclusive {
        partition: u32,
        column: usize,
        got: u32,
        expected: u32,
    },
    #[error("no progress after {steps} steps")]
    NoProgress { steps: usize },
}

/// Summary of a completed simulated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReport {
    /// Exclusive prefix per partition and column.
    pub exclusive: Vec<Vec<u32>>,
    pub steps: usize,
    pub transitions: usize,
    pub stalls: u32,
    pub fallbacks: u32,
}

/// Status cells that check every access against the true aggregates.
pub struct ModelCells {
    cells: Vec<Cell<u32>>,
    columns: usize,
    /// Inclusive prefix of each row: `inclusive[row][column]`, row 0 the seed.
    inclusive: Vec<Vec<u32>>,
    aggregates: Vec<Vec<u32>>,
    walker: Cell<Option<u32>>,
    resolved_owner: Cell<Option<u32>>,
    transitions: Cell<usize>,
    violation: RefCell<Option<ModelViolation>>,
}

impl ModelCells {
    fn new(aggregates: &[Vec<u32>], columns: usize) -> Self {
        let mut inclusive = vec![vec![0u32; columns]];
        for row in aggregates {
            let prev = &inclusive[inclusive.len() - 1];
            let next = prev.iter().zip(row).map(|(a, b)| a + b).collect();
            inclusive.push(next);
        }
        let cells = (0..(aggregates.len() + 1) * columns)
            .map(|i| {
                Cell::new(if i < columns {
                    pack(CellFlag::Inclusive, 0)
                } else {
                    pack(CellFlag::NotReady, 0)
                })
            })
            .collect();
        Self {
            cells,
            columns,
            inclusive,
            aggregates: aggregates.to_vec(),
            walker: Cell::new(None),
            resolved_owner: Cell::new(None),
            transitions: Cell::new(0),
            violation: RefCell::new(None),
        }
    }

    fn flag(&self, violation: ModelViolation) {
        let mut slot = self.violation.borrow_mut();
        if slot.is_none() {
            *slot = Some(violation);
        }
    }

    fn check_value(&self, index: usize, cell: u32) {
        let row = index / self.columns;
        let column = index % self.columns;
        let expected = match unpack(cell) {
            (CellFlag::NotReady, _) => return,
            (CellFlag::Aggregate, _) if row == 0 => self.inclusive[0][column],
            (CellFlag::Aggregate, _) => self.aggregates[row - 1][column],
            (CellFlag::Inclusive, _) => self.inclusive[row][column],
        };
        let observed = unpack(cell).1;
        if observed != expected {
            self.flag(ModelViolation::WrongValue {
                index,
                observed,
                expected,
            });
        }
    }

    fn take_violation(&self) -> Option<ModelViolation> {
        self.violation.borrow_mut().take()
    }
}

impl StatusCells for ModelCells {
    fn load_cell(&self, index: usize) -> u32 {
        if let Some(observer) = self.walker.get() {
            let row = index / self.columns;
            if row > observer as usize {
                self.flag(ModelViolation::ObservedSuccessor { observer, row });
            }
        }
        let cell = self.cells[index].get();
        self.check_value(index, cell);
        cell
    }

    fn compare_exchange_cell(&self, index: usize, current: u32, new: u32) -> Result<u32, u32> {
        let actual = self.cells[index].get();
        if actual != current {
            return Err(actual);
        }
        let (from, _) = unpack(actual);
        let (to, _) = unpack(new);
        if to <= from {
            self.flag(ModelViolation::NonMonotonic { index, from, to });
        }
        if to == CellFlag::Inclusive {
            let owner_row = self.resolved_owner.get().map(|p| p as usize + 1);
            if owner_row != Some(index / self.columns) {
                self.flag(ModelViolation::PrematureInclusive { index });
            }
        }
        self.check_value(index, new);
        self.cells[index].set(new);
        self.transitions.set(self.transitions.get() + 1);
        Ok(actual)
    }
}

enum Phase {
    Publishing { column: usize },
    Walking {
        column: usize,
        walker: LookbackWalker,
        poller: Poller,
    },
    Done,
}

struct Actor {
    partition: u32,
    phase: Phase,
    exclusive: Vec<u32>,
}

/// A lookback scenario: per-partition, per-column aggregates plus a polling policy.
#[derive(Debug, Clone)]
pub struct LookbackModel {
    aggregates: Vec<Vec<u32>>,
    columns: usize,
    policy: SpinPolicy,
}

impl LookbackModel {
    /// `aggregates[partition][column]`; every row must have the same width.
    pub fn new(aggregates: Vec<Vec<u32>>, policy: SpinPolicy) -> Self {
        let columns = aggregates.first().map_or(1, Vec::len).max(1);
        debug_assert!(aggregates.iter().all(|row| row.len() == columns));
        Self {
            aggregates,
            columns,
            policy,
        }
    }

    /// One value per partition.
    pub fn single_column(aggregates: &[u32], policy: SpinPolicy) -> Self {
        Self::new(aggregates.iter().map(|&a| vec![a]).collect(), policy)
    }

    pub fn partitions(&self) -> usize {
        self.aggregates.len()
    }

    /// Replay `schedule`, then finish by always stepping the lowest unfinished partition.
    pub fn run(&self, schedule: &[usize]) -> Result<ModelReport, ModelViolation> {
        let cells = ModelCells::new(&self.aggregates, self.columns);
        let mut actors: Vec<Actor> = Vec::with_capacity(self.partitions());
        let mut steps = 0usize;
        let mut stalls = 0u32;
        let mut fallbacks = 0u32;

        for &choice in schedule {
            let mut movable: Vec<Option<usize>> = actors
                .iter()
                .enumerate()
                .filter(|(_, a)| !matches!(a.phase, Phase::Done))
                .map(|(i, _)| Some(i))
                .collect();
            if actors.len() < self.partitions() {
                movable.push(None);
            }
            if movable.is_empty() {
                break;
            }
            match movable[choice % movable.len()] {
                Some(i) => self.step(&mut actors[i], &cells, &mut stalls, &mut fallbacks),
                None => actors.push(self.start(actors.len() as u32)),
            }
            steps += 1;
            if let Some(violation) = cells.take_violation() {
                return Err(violation);
            }
        }

        let limit = steps + (self.partitions() + 1) * (self.columns * 4 + 4);
        loop {
            let next = actors.iter().position(|a| !matches!(a.phase, Phase::Done));
            match next {
                Some(i) => self.step(&mut actors[i], &cells, &mut stalls, &mut fallbacks),
                None if actors.len() < self.partitions() => {
                    actors.push(self.start(actors.len() as u32))
                }
                None => break,
            }
            steps += 1;
            if let Some(violation) = cells.take_violation() {
                return Err(violation);
            }
            if steps > limit {
                return Err(ModelViolation::NoProgress { steps });
            }
        }

        for actor in &actors {
            for column in 0..self.columns {
                let expected = cells.inclusive[actor.partition as usize][column];
                let got = actor.exclusive[column];
                if got != expected {
                    return Err(ModelViolation::WrongExclusive {
                        partition: actor.partition,
                        column,
                        got,
                        expected,
                    });
                }
            }
        }

        Ok(ModelReport {
            exclusive: actors.into_iter().map(|a| a.exclusive).collect(),
            steps,
            transitions: cells.transitions.get(),
            stalls,
            fallbacks,
        })
    }

    fn start(&self, partition: u32) -> Actor {
        Actor {
            partition,
            phase: Phase::Publishing { column: 0 },
            exclusive: vec![0; self.columns],
        }
    }

    fn step(&self, actor: &mut Actor, cells: &ModelCells, stalls: &mut u32, fallbacks: &mut u32) {
        let p = actor.partition;
        let own_row = p as usize + 1;
        match &mut actor.phase {
            Phase::Publishing { column } => {
                let c = *column;
                publish(
                    cells,
                    own_row * self.columns + c,
                    CellFlag::Aggregate,
                    self.aggregates[p as usize][c],
                );
                actor.phase = if c + 1 < self.columns {
                    Phase::Publishing { column: c + 1 }
                } else {
                    self.walk(p, 0)
                };
            }
            Phase::Walking {
                column,
                walker,
                poller,
            } => {
                let c = *column;
                cells.walker.set(Some(p));
                let step = walker.step(cells);
                cells.walker.set(None);
                match step {
                    WalkStep::Resolved(exclusive) => {
                        cells.resolved_owner.set(Some(p));
                        publish(
                            cells,
                            own_row * self.columns + c,
                            CellFlag::Inclusive,
                            exclusive + self.aggregates[p as usize][c],
                        );
                        cells.resolved_owner.set(None);
                        actor.exclusive[c] = exclusive;
                        actor.phase = if c + 1 < self.columns {
                            self.walk(p, c + 1)
                        } else {
                            Phase::Done
                        };
                    }
                    WalkStep::Continue => poller.on_progress(),
                    WalkStep::Stalled => {
                        *stalls += 1;
                        if poller.on_stall() == StallAction::Fallback {
                            if let Some(pred) = walker.pending_partition() {
                                let aggregate = self.aggregates[pred as usize][c];
                                if self.policy.publish_fallback {
                                    publish(cells, walker.cell_index(), CellFlag::Aggregate, aggregate);
                                }
                                walker.absorb(aggregate);
                                *fallbacks += 1;
                            }
                        }
                    }
                }
            }
            Phase::Done => {}
        }
    }

    fn walk(&self, partition: u32, column: usize) -> Phase {
        Phase::Walking {
            column,
            walker: LookbackWalker::new(partition, column, self.columns),
            poller: Poller::new(self.policy),
        }
    }
}
