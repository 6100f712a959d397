use figment::{
    providers::{Format, Toml},
    Figment,
};

use fragtreer::{FragTreer, InputDocument};

#[test_log::test]
fn test_configured() -> Result<(), Box<dyn std::error::Error>> {
    let config = Figment::new().merge(Toml::file_exact("tests/data/hexose.toml"));
    let driver: FragTreer = config.extract()?;
    assert_eq!(driver.number_of_results, 2);
    assert_eq!(driver.solvers, vec!["dp", "microlp"]);
    assert_eq!(driver.tree_timeout, Some(10.0));
    assert_eq!(driver.scoring.prior_weight, 0.5);
    assert_eq!(driver.compute_config().tree_timeout, Some(10.0));
    driver.main()?;
    Ok(())
}

#[test]
fn test_input_document() -> Result<(), Box<dyn std::error::Error>> {
    let document = InputDocument::read("tests/data/hexose.json")?;
    assert_eq!(document.instances.len(), 1);
    let instance = &document.instances[0];
    assert_eq!(instance.candidates()?.len(), 5);
    assert_eq!(instance.candidates()?[1].prior_score, -0.5);
    Ok(())
}
