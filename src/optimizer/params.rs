/// A model parameter that is either one scalar for the whole horizon or one
/// value per hour. Price reconstruction reads both shapes through the same
/// accessor.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Scalar(f64),
    PerHour(Vec<f64>),
}

impl Param {
    pub fn at(&self, t: usize) -> f64 {
        match self {
            Param::Scalar(value) => *value,
            Param::PerHour(values) => values[t],
        }
    }

    pub fn sum(&self, horizon: usize) -> f64 {
        match self {
            Param::Scalar(value) => value * horizon as f64,
            Param::PerHour(values) => values.iter().take(horizon).sum(),
        }
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Scalar(value)
    }
}

impl From<Vec<f64>> for Param {
    fn from(values: Vec<f64>) -> Self {
        Param::PerHour(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_ignores_index() {
        let param = Param::from(1.5);
        assert_eq!(param.at(0), 1.5);
        assert_eq!(param.at(23), 1.5);
    }

    #[test]
    fn test_per_hour_indexes() {
        let param = Param::from(vec![1.0, 2.0, 3.0]);
        assert_eq!(param.at(1), 2.0);
        assert_eq!(param.sum(3), 6.0);
    }
}
