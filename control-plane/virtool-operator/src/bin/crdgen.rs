use kube::core::CustomResourceExt;
use virtool_operator::crd::virtool_app::VirtoolApp;

fn main() -> anyhow::Result<()> {
    let crd = VirtoolApp::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);
    Ok(())
}
