//! The simulation driver: one global clock, a fixed component order, and a
//! deadlock dump when the hierarchy stops making progress.

use crate::sync::{Arc, Mutex};
use crate::Operable;

#[derive(Default)]
pub struct Simulator {
    components: Vec<Arc<Mutex<dyn Operable>>>,
    cycle: u64,
}

impl Simulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Components are operated in registration order
    /// every cycle; put upper levels before lower levels to mirror the
    /// hardware's request flow.
    pub fn add_component(&mut self, component: Arc<Mutex<dyn Operable>>) {
        self.components.push(component);
    }

    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    /// Advance the whole hierarchy by one cycle.
    pub fn cycle(&mut self) {
        self.cycle += 1;
        for component in &self.components {
            component.lock().operate(self.cycle);
        }
    }

    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.cycle();
        }
    }

    /// Any component still holding in-flight work?
    #[must_use]
    pub fn busy(&self) -> bool {
        self.components.iter().any(|component| component.lock().busy())
    }

    /// Run until every component drains, or until `max_cycles` more cycles
    /// have elapsed. On timeout the residual state of every component is
    /// dumped and false is returned.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> bool {
        let deadline = self.cycle + max_cycles;
        while self.busy() {
            if self.cycle >= deadline {
                log::error!("no progress after {max_cycles} cycles, dumping residual state");
                self.print_deadlock();
                return false;
            }
            self.cycle();
        }
        true
    }

    pub fn print_deadlock(&self) {
        for component in &self.components {
            component.lock().print_deadlock();
        }
    }
}
