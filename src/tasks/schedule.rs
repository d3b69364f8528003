//! The fixed one-second slot table.
//!
//! Two nested counters tick on every 10 ms slice: `fine` 0..=9 and, each time
//! it wraps, `coarse` 0..=9. Every slice polls the pressure sensor and the
//! buttons. The fine slot picks the 100 ms pattern, and fine slot 9 hands over
//! to the coarse slot so each once-a-second task lands in its own 100 ms
//! block.

/// Every task the loop knows about, in run priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Task {
    Pressure,
    Buttons,
    Motion,
    Wind,
    Gps,
    Power,
    Log,
    Display,
    Ambient,
    Storage,
    Radio,
}

impl Task {
    pub const PRIORITY: [Task; 11] = [
        Task::Pressure,
        Task::Buttons,
        Task::Motion,
        Task::Wind,
        Task::Gps,
        Task::Power,
        Task::Log,
        Task::Display,
        Task::Ambient,
        Task::Storage,
        Task::Radio,
    ];

    fn bit(self) -> u16 {
        1 << self as u8
    }
}

/// Ambient (temperature/humidity) sensors convert in one slot and are read
/// in a later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AmbientStep {
    Start,
    Read,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskSet(u16);

impl TaskSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, task: Task) {
        self.0 |= task.bit();
    }

    pub fn contains(&self, task: Task) -> bool {
        self.0 & task.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in priority order.
    pub fn iter(&self) -> impl Iterator<Item = Task> + '_ {
        Task::PRIORITY.into_iter().filter(|t| self.contains(*t))
    }
}

/// What one slice has to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Due {
    pub fine: u8,
    pub coarse: u8,
    pub tasks: TaskSet,
    /// The pressure poll should start a new conversion cycle.
    pub start_pressure_cycle: bool,
    pub ambient: Option<AmbientStep>,
}

/// Fixed slot table for the (fine, coarse) position.
pub fn due_at(fine: u8, coarse: u8) -> Due {
    let mut tasks = TaskSet::empty();
    tasks.insert(Task::Pressure);
    tasks.insert(Task::Buttons);
    let mut ambient = None;

    match fine {
        1 | 6 => tasks.insert(Task::Motion),
        2 => tasks.insert(Task::Wind),
        7 => tasks.insert(Task::Radio),
        9 => match coarse {
            0 | 5 => tasks.insert(Task::Gps),
            1 => tasks.insert(Task::Power),
            2 => tasks.insert(Task::Log),
            3 | 8 => tasks.insert(Task::Display),
            4 => {
                tasks.insert(Task::Ambient);
                ambient = Some(AmbientStep::Read);
            }
            6 => tasks.insert(Task::Storage),
            9 => {
                tasks.insert(Task::Ambient);
                ambient = Some(AmbientStep::Start);
            }
            _ => {}
        },
        _ => {}
    }

    Due {
        fine,
        coarse,
        tasks,
        start_pressure_cycle: fine == 0 || fine == 5,
        ambient,
    }
}

pub struct TaskSchedule {
    fine: u8,
    coarse: u8,
}

impl Default for TaskSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSchedule {
    /// The first [`advance`](Self::advance) lands on slot (0, 0).
    pub const fn new() -> Self {
        Self { fine: 9, coarse: 9 }
    }

    pub fn position(&self) -> (u8, u8) {
        (self.fine, self.coarse)
    }

    /// Moves to the next 10 ms slot and returns what is due there.
    pub fn advance(&mut self) -> Due {
        self.fine = (self.fine + 1) % 10;
        if self.fine == 0 {
            self.coarse = (self.coarse + 1) % 10;
        }
        due_at(self.fine, self.coarse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(dues: &[Due], task: Task) -> usize {
        dues.iter().filter(|d| d.tasks.contains(task)).count()
    }

    #[test]
    fn first_slot_is_zero_zero() {
        let mut schedule = TaskSchedule::new();
        let due = schedule.advance();
        assert_eq!((due.fine, due.coarse), (0, 0));
        assert!(due.start_pressure_cycle);
    }

    #[test]
    fn pressure_and_motion_twice_per_block() {
        let mut schedule = TaskSchedule::new();
        // Any ten consecutive slices, whatever the phase
        for _ in 0..3 {
            schedule.advance();
        }
        let block: Vec<Due> = (0..10).map(|_| schedule.advance()).collect();
        assert_eq!(block.iter().filter(|d| d.start_pressure_cycle).count(), 2);
        assert_eq!(count(&block, Task::Motion), 2);
        assert_eq!(count(&block, Task::Pressure), 10);
    }

    #[test]
    fn one_second_pattern() {
        let mut schedule = TaskSchedule::new();
        let second: Vec<Due> = (0..100).map(|_| schedule.advance()).collect();

        assert_eq!(second.iter().filter(|d| d.start_pressure_cycle).count(), 20);
        assert_eq!(count(&second, Task::Motion), 20);
        assert_eq!(count(&second, Task::Wind), 10);
        assert_eq!(count(&second, Task::Radio), 10);
        assert_eq!(count(&second, Task::Gps), 2);
        assert_eq!(count(&second, Task::Display), 2);
        for task in [Task::Power, Task::Log, Task::Storage] {
            assert_eq!(count(&second, task), 1);
        }
        let ambient: Vec<_> = second.iter().filter_map(|d| d.ambient).collect();
        assert_eq!(ambient, vec![AmbientStep::Read, AmbientStep::Start]);
    }

    #[test]
    fn coarse_tasks_never_share_a_slot() {
        let once_a_second = [Task::Gps, Task::Power, Task::Log, Task::Display, Task::Ambient, Task::Storage];
        for coarse in 0..10 {
            for fine in 0..10 {
                let due = due_at(fine, coarse);
                assert!(once_a_second.iter().filter(|t| due.tasks.contains(**t)).count() <= 1);
            }
        }
    }

    #[test]
    fn iterates_in_priority_order() {
        let mut set = TaskSet::empty();
        set.insert(Task::Radio);
        set.insert(Task::Motion);
        set.insert(Task::Pressure);
        set.insert(Task::Display);
        let order: Vec<Task> = set.iter().collect();
        assert_eq!(order, vec![Task::Pressure, Task::Motion, Task::Display, Task::Radio]);
        assert_eq!(set.len(), 4);
    }
}
