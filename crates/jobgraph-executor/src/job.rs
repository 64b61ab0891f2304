//! Job definition
//!
//! A job couples a printable name with a run function. The run function
//! receives the `(upstream name, upstream output)` pairs of every
//! dependency and produces either an output or a negative error code.
//! Any extra input the job needs is captured by the closure and dropped
//! with it.

use std::sync::Arc;

/// One `(upstream name, upstream output)` pair handed to a run function
///
/// The output is shared: every dependent of the same upstream sees the
/// same `Arc`.
#[derive(Clone)]
pub struct JobInput<T> {
    pub name: Arc<str>,
    pub data: Arc<T>,
}

pub(crate) type JobRunFn<T> = Arc<dyn Fn(&[JobInput<T>]) -> Result<T, i32> + Send + Sync>;

/// A schedulable unit of work producing a `T`
pub struct Job<T> {
    name: String,
    pub(crate) run: JobRunFn<T>,
}

impl<T> Job<T> {
    /// Define a job
    ///
    /// `run` returns `Ok(output)` on success or `Err(code)` with a
    /// negative code on failure; the code is propagated to the caller of
    /// the run that scheduled this job.
    pub fn new(
        name: &str,
        run: impl Fn(&[JobInput<T>]) -> Result<T, i32> + Send + Sync + 'static,
    ) -> Job<T> {
        Job {
            name: name.to_owned(),
            run: Arc::new(run),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_sees_inputs() {
        let j: Job<i32> = Job::new("sum", |inputs| {
            Ok(inputs.iter().map(|i| *i.data).sum())
        });
        let inputs = vec![
            JobInput { name: Arc::from("a"), data: Arc::new(1) },
            JobInput { name: Arc::from("b"), data: Arc::new(2) },
        ];
        assert_eq!((j.run)(&inputs), Ok(3));
        assert_eq!(j.name(), "sum");
    }

    #[test]
    fn test_error_code_passthrough() {
        let j: Job<i32> = Job::new("boom", |_| Err(-7));
        assert_eq!((j.run)(&[]), Err(-7));
    }
}
