//! Worker pools with two priority lanes. Query dispatch enqueues High;
//! maintenance work rides Low. The weight dial sets how many of every
//! hundred picks prefer the high lane (100 starves Low while High has
//! work, the default).

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

pub struct ThreadPool {
    high: Sender<Job>,
    low: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize, high_weight: u32) -> Self {
        let (high_tx, high_rx) = unbounded::<Job>();
        let (low_tx, low_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for worker in 0..size {
            let high_rx = high_rx.clone();
            let low_rx = low_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn(move || worker_loop(high_rx, low_rx, high_weight))
                .expect("spawn pool worker");
            workers.push(handle);
        }
        ThreadPool { high: high_tx, low: low_tx, workers, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn schedule(&self, priority: Priority, job: impl FnOnce() + Send + 'static) {
        let sender = match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        };
        // a disconnected channel means the pool is shutting down; the job is
        // dropped with it
        let _ = sender.send(Box::new(job));
    }

    /// Drops the lanes and joins every worker. Also runs on drop.
    pub fn shutdown(&mut self) {
        let (high, _) = unbounded();
        let (low, _) = unbounded();
        self.high = high;
        self.low = low;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(high: Receiver<Job>, low: Receiver<Job>, high_weight: u32) {
    let mut pick = 0u32;
    loop {
        let prefer_high = pick % 100 < high_weight;
        pick = pick.wrapping_add(1);
        let job = if prefer_high {
            match high.try_recv() {
                Ok(job) => Some(job),
                Err(_) => low.try_recv().ok(),
            }
        } else {
            match low.try_recv() {
                Ok(job) => Some(job),
                Err(_) => high.try_recv().ok(),
            }
        };
        match job {
            Some(job) => job(),
            None => {
                // both lanes empty: block until either produces or closes
                crossbeam_channel::select! {
                    recv(high) -> job => match job {
                        Ok(job) => job(),
                        Err(_) => return,
                    },
                    recv(low) -> job => match job {
                        Ok(job) => job(),
                        Err(_) => return,
                    },
                }
            }
        }
    }
}
