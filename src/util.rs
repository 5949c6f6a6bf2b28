use std::time::Duration;

pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

/// Population standard deviation
pub fn std_dev(data: &[f64]) -> Option<f64> {
    let m = mean(data)?;
    let variance = data
        .iter()
        .map(|value| {
            let diff = m - *value;

            diff * diff
        })
        .sum::<f64>()
        / data.len() as f64;

    Some(variance.sqrt())
}

/// Elapsed-time readout as `SS:cc` (seconds, centiseconds).
pub fn format_readout(elapsed: Duration) -> String {
    let centis = elapsed.as_millis() / 10;
    format!("{:02}:{:02}", centis / 100, centis % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_readout() {
        assert_eq!(format_readout(Duration::ZERO), "00:00");
        assert_eq!(format_readout(Duration::from_millis(1_234)), "01:23");
        assert_eq!(format_readout(Duration::from_millis(14_999)), "14:99");
        assert_eq!(format_readout(Duration::from_secs(125)), "125:00");
    }

    #[test]
    fn test_mean_of_response_times() {
        assert_eq!(mean(&[0.5, 1.5, 1.0]), Some(1.0));
        assert_eq!(mean(&[15.0]), Some(15.0));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), Some(2.0));
        assert_eq!(std_dev(&[0.5, 0.5, 0.5]), Some(0.0));
        assert_eq!(std_dev(&[]), None);
    }
}
