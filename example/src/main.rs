use std::sync::Arc;

use txkv::error::{CResult, Error};
use txkv::storage::data::Additive;
use txkv::tictoc::{Config, TicToc};

fn main() {
    println!("Hello, txkv!");

    run().unwrap();

    println!("Bye~");
}

fn run() -> CResult<()> {
    let dir = tempdir::TempDir::new("txkv-example")?;
    let path = dir.path().join("txkvdb");

    let config = Config { data: Arc::new(Additive), ..Config::default() };
    let db = TicToc::create(path, config)?;

    // A simple transactional write.
    let mut txn = db.begin()?;
    txn.insert(b"greeting", b"hi there")?;
    txn.commit()?;

    let mut txn = db.begin()?;
    assert_eq!(txn.lookup(b"greeting")?, Some(b"hi there".to_vec()));
    txn.commit()?;

    // Counter updates merge through the data config; conflicting
    // transactions abort and retry.
    for _ in 0..10 {
        loop {
            let mut txn = db.begin()?;
            txn.update(b"counter", &Additive::encode(1))?;
            match txn.commit() {
                Ok(_) => break,
                Err(Error::Abort) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    let mut txn = db.begin()?;
    let counter = txn.lookup(b"counter")?.map(|v| Additive::decode(&v)).transpose()?;
    txn.commit()?;
    assert_eq!(counter, Some(10));
    println!("counter = {:?}", counter);

    let status = db.status()?;
    println!("status: {:?}", status);

    db.close()?;

    Ok(())
}
