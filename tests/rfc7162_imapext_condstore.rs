mod common;

use anyhow::Result;
use common::*;

#[tokio::test]
async fn fetch_modseq_announces_highestmodseq_first() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 2).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "01").await?;

    send(&mut imap, "02 FETCH 1:2 (UID MODSEQ)\r\n").await?;
    let read = read_until(&mut imap, "02 OK").await?;
    let announce = read
        .find("* OK [HIGHESTMODSEQ ")
        .expect("condstore announcement");
    let first_fetch = read.find("* 1 FETCH (UID 1 MODSEQ (").expect("fetch line");
    assert!(announce < first_fetch, "got {}", read);
    assert!(read.contains("* 2 FETCH (UID 2 MODSEQ ("));

    // second MODSEQ use does not re-announce
    send(&mut imap, "03 FETCH 1 (MODSEQ)\r\n").await?;
    let read = read_until(&mut imap, "03 OK").await?;
    assert!(!read.contains("* OK [HIGHESTMODSEQ"));
    Ok(())
}

#[tokio::test]
async fn select_condstore_enables_reporting() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 1).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;

    send(&mut imap, "01 SELECT INBOX (CONDSTORE)\r\n").await?;
    let read = read_until(&mut imap, "01 OK").await?;
    assert!(read.contains("CONDSTORE enabled"));

    // STORE now reports MODSEQ in its FETCH responses
    send(&mut imap, "02 STORE 1 +FLAGS (\\Flagged)\r\n").await?;
    let read = read_until(&mut imap, "02 OK").await?;
    assert!(read.contains("MODSEQ ("), "got {}", read);
    assert!(read.contains("FLAGS (\\Flagged)"));
    Ok(())
}

#[tokio::test]
async fn store_unchangedsince_reports_modified() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 3).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "01").await?;

    // bump message 3 past the others
    send(&mut imap, "02 STORE 3 +FLAGS.SILENT (\\Answered)\r\n").await?;
    read_until(&mut imap, "02 OK").await?;

    // fetch current modseq of message 2 to use as the bound
    send(&mut imap, "03 FETCH 2 (MODSEQ)\r\n").await?;
    let read = read_until(&mut imap, "03 OK").await?;
    let bound = parse_modseq(&read, "* 2 FETCH (MODSEQ (");

    send(
        &mut imap,
        &format!("04 STORE 1:3 (UNCHANGEDSINCE {}) +FLAGS (\\Seen)\r\n", bound),
    )
    .await?;
    let read = read_until(&mut imap, "04 OK").await?;
    assert!(read.contains("* 1 FETCH ("));
    assert!(read.contains("* 2 FETCH ("));
    assert!(
        read.contains("04 OK [MODIFIED 3]"),
        "message 3 should fail the bound: {}",
        read
    );

    // no-op store must not bump HIGHESTMODSEQ
    send(&mut imap, "05 FETCH 1 (MODSEQ)\r\n").await?;
    let read = read_until(&mut imap, "05 OK").await?;
    let before = parse_modseq(&read, "* 1 FETCH (MODSEQ (");
    send(&mut imap, "06 STORE 1 +FLAGS (\\Seen)\r\n").await?;
    read_until(&mut imap, "06 OK").await?;
    send(&mut imap, "07 FETCH 1 (MODSEQ)\r\n").await?;
    let read = read_until(&mut imap, "07 OK").await?;
    assert_eq!(before, parse_modseq(&read, "* 1 FETCH (MODSEQ ("));
    Ok(())
}

#[tokio::test]
async fn fetch_changedsince_filters() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 2).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "01").await?;

    send(&mut imap, "02 FETCH 2 (MODSEQ)\r\n").await?;
    let read = read_until(&mut imap, "02 OK").await?;
    let bound = parse_modseq(&read, "* 2 FETCH (MODSEQ (");

    send(&mut imap, "03 STORE 2 +FLAGS.SILENT (\\Flagged)\r\n").await?;
    read_until(&mut imap, "03 OK").await?;

    send(
        &mut imap,
        &format!("04 UID FETCH 1:* (FLAGS) (CHANGEDSINCE {})\r\n", bound),
    )
    .await?;
    let read = read_until(&mut imap, "04 OK").await?;
    assert!(!read.contains("* 1 FETCH"), "got {}", read);
    assert!(read.contains("* 2 FETCH (FLAGS (\\Flagged) UID 2)"));
    Ok(())
}

#[tokio::test]
async fn search_modseq_trailer_and_esearch() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 3).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "01").await?;

    send(&mut imap, "02 SEARCH MODSEQ 1\r\n").await?;
    let read = read_until(&mut imap, "02 OK").await?;
    assert!(read.contains("* SEARCH 1 2 3 (MODSEQ "), "got {}", read);

    // ESEARCH parameter order: COUNT, MIN, MAX, ALL, MODSEQ
    send(
        &mut imap,
        "03 UID SEARCH RETURN (ALL COUNT MIN MAX) MODSEQ 1\r\n",
    )
    .await?;
    let read = read_until(&mut imap, "03 OK").await?;
    let line_start = read.find("* ESEARCH").expect("esearch line");
    let line = &read[line_start..read[line_start..].find("\r\n").unwrap() + line_start];
    assert!(
        line.starts_with("* ESEARCH (TAG \"03\") UID COUNT 3 MIN 1 MAX 3 ALL 1:3 MODSEQ "),
        "got {}",
        line
    );
    Ok(())
}

#[tokio::test]
async fn enable_condstore() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 1).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;

    send(&mut imap, "01 ENABLE CONDSTORE\r\n").await?;
    let read = read_until(&mut imap, "01 OK").await?;
    assert!(read.contains("* ENABLED CONDSTORE"));

    // already enabled: not repeated
    send(&mut imap, "02 ENABLE CONDSTORE\r\n").await?;
    let read = read_until(&mut imap, "02 OK").await?;
    assert!(read.contains("* ENABLED\r\n"), "got {}", read);

    select_inbox(&mut imap, "03").await?;
    send(&mut imap, "04 STORE 1 +FLAGS (\\Seen)\r\n").await?;
    let read = read_until(&mut imap, "04 OK").await?;
    assert!(read.contains("MODSEQ ("));
    Ok(())
}

fn parse_modseq(text: &str, prefix: &str) -> u64 {
    let at = text.find(prefix).unwrap_or_else(|| panic!("no {:?} in {}", prefix, text));
    text[at + prefix.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .expect("modseq digits")
}
