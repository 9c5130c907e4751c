use std::time::Duration;

/// Exponential backoff between replay passes that left entries queued.
#[derive(Debug, Clone)]
pub struct Backoff {
  pub base: Duration,
  pub max: Duration,
  pub jitter_max: Option<Duration>,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(2),
      max: Duration::from_secs(300),
      jitter_max: Some(Duration::from_secs(1)),
    }
  }
}

impl Backoff {
  /// Delay before the next pass after `failures` consecutive passes that
  /// still had retrying entries. Doubles per failure, capped at `max`, plus
  /// random jitter.
  pub fn delay(&self, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    let delay = self.base.saturating_mul(1u32 << exp).min(self.max);

    match self.jitter_max {
      Some(jitter) if !jitter.is_zero() => {
        let jitter_ms = jitter.as_millis() as u64;
        delay + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
      }
      _ => delay,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn no_jitter() -> Backoff {
    Backoff {
      base: Duration::from_secs(2),
      max: Duration::from_secs(60),
      jitter_max: None,
    }
  }

  #[test]
  fn test_delay_doubles_and_caps() {
    let backoff = no_jitter();
    assert_eq!(backoff.delay(1), Duration::from_secs(2));
    assert_eq!(backoff.delay(2), Duration::from_secs(4));
    assert_eq!(backoff.delay(5), Duration::from_secs(32));
    assert_eq!(backoff.delay(6), Duration::from_secs(60));
    assert_eq!(backoff.delay(1000), Duration::from_secs(60));
  }

  #[test]
  fn test_jitter_is_bounded() {
    let backoff = Backoff {
      jitter_max: Some(Duration::from_millis(500)),
      ..no_jitter()
    };
    for _ in 0..100 {
      let d = backoff.delay(1);
      assert!(d >= Duration::from_secs(2));
      assert!(d <= Duration::from_millis(2500));
    }
  }
}
