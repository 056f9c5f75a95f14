mod common;

use anyhow::Result;
use common::*;

#[tokio::test]
async fn greeting_noop_login_logout() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;

    send(&mut imap, "t01 NOOP\r\n").await?;
    read_until(&mut imap, "t01 OK").await?;

    // wrong state
    send(&mut imap, "t02 SELECT INBOX\r\n").await?;
    let read = read_until(&mut imap, "t02 BAD").await?;
    assert!(read.contains("bad mode for command SELECT"));

    send(&mut imap, "t03 LOGIN alice wrong\r\n").await?;
    let read = read_until(&mut imap, "t03 NO").await?;
    assert!(read.contains("bad credentials"));

    send(&mut imap, "t04 LOGIN alice hunter2\r\n").await?;
    read_until(&mut imap, "t04 OK").await?;

    // second login is a mode error
    send(&mut imap, "t05 LOGIN alice hunter2\r\n").await?;
    read_until(&mut imap, "t05 BAD").await?;

    send(&mut imap, "t06 LOGOUT\r\n").await?;
    let read = read_until(&mut imap, "t06 OK").await?;
    assert!(read.contains("* BYE"));
    Ok(())
}

#[tokio::test]
async fn capability_changes_after_login() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;

    send(&mut imap, "c1 CAPABILITY\r\n").await?;
    let read = read_until(&mut imap, "c1 OK").await?;
    assert!(read.contains("IMAP4rev1"));
    assert!(read.contains("AUTH=PLAIN"));
    assert!(!read.contains("CONDSTORE"));

    login(&mut imap).await?;
    send(&mut imap, "c2 CAPABILITY\r\n").await?;
    let read = read_until(&mut imap, "c2 OK").await?;
    for ext in [
        "COMPRESS=DEFLATE",
        "CONDSTORE",
        "ESEARCH",
        "IDLE",
        "LIST-EXTENDED",
        "MOVE",
        "SPECIAL-USE",
        "UIDPLUS",
    ] {
        assert!(read.contains(ext), "missing {} in {}", ext, read);
    }
    Ok(())
}

#[tokio::test]
async fn authenticate_plain() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;

    // \0alice\0hunter2
    send(&mut imap, "a1 AUTHENTICATE PLAIN\r\n").await?;
    read_until(&mut imap, "+").await?;
    send(&mut imap, "AGFsaWNlAGh1bnRlcjI=\r\n").await?;
    read_until(&mut imap, "a1 OK").await?;

    send(&mut imap, "a2 SELECT INBOX\r\n").await?;
    read_until(&mut imap, "a2 OK").await?;
    Ok(())
}

#[tokio::test]
async fn select_reports_mailbox_state() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 4).await?;

    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    let read = select_inbox(&mut imap, "01").await?;

    assert!(read.contains("* 4 EXISTS"), "got {}", read);
    assert!(read.contains("* 4 RECENT"), "got {}", read);
    assert!(read.contains("* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)"));
    assert!(read.contains("* OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)]"));
    assert!(read.contains("* OK [HIGHESTMODSEQ "));
    assert!(read.contains("* OK [UNSEEN 1]"));
    assert!(read.contains("* OK [UIDVALIDITY 1]"));
    assert!(read.contains("* OK [UIDNEXT 5]"));
    assert!(read.contains("01 OK [READ-WRITE] SELECT completed"));

    // EXAMINE is read-only
    send(&mut imap, "02 EXAMINE INBOX\r\n").await?;
    let read = read_until(&mut imap, "02 OK").await?;
    assert!(read.contains("02 OK [READ-ONLY] EXAMINE completed"));
    send(&mut imap, "03 STORE 1 +FLAGS (\\Seen)\r\n").await?;
    read_until(&mut imap, "03 NO").await?;
    Ok(())
}

#[tokio::test]
async fn fetch_items_and_body_ordering() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 2).await?;

    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "20").await?;

    send(&mut imap, "21 FETCH 1:2 (UID FLAGS RFC822.SIZE INTERNALDATE)\r\n").await?;
    let read = read_until(&mut imap, "21 OK").await?;
    assert!(read.contains("* 1 FETCH (UID 1 FLAGS () RFC822.SIZE "));
    assert!(read.contains("* 2 FETCH (UID 2 "));
    assert!(read.contains("INTERNALDATE \""));

    // non-BODY items precede BODY items regardless of request order
    send(&mut imap, "22 FETCH 1 (BODY[] UID)\r\n").await?;
    let read = read_until(&mut imap, "22 OK").await?;
    let fetch_line_at = read.find("* 1 FETCH (UID 1 BODY[] {").expect("reordered fetch line");
    assert!(fetch_line_at < read.find("22 OK").expect("completion"));
    assert!(read.contains("Subject: message 1"));

    send(&mut imap, "23 FETCH 1 BODY.PEEK[HEADER.FIELDS (Subject)]\r\n").await?;
    let read = read_until(&mut imap, "23 OK").await?;
    assert!(read.contains("BODY[HEADER.FIELDS (Subject)] {"));
    assert!(read.contains("Subject: message 1"));
    assert!(!read.contains("From:"));

    send(&mut imap, "24 FETCH 1 (ENVELOPE)\r\n").await?;
    let read = read_until(&mut imap, "24 OK").await?;
    assert!(read.contains("ENVELOPE (\"Mon, 7 Feb 1994 21:52:25 -0800\" \"message 1\" ((\"Bob\" NIL bob example.tld))"));

    // partial fetch clamps
    send(&mut imap, "25 FETCH 1 BODY.PEEK[TEXT]<0.5>\r\n").await?;
    let read = read_until(&mut imap, "25 OK").await?;
    assert!(read.contains("BODY[TEXT]<0> {5}"));
    Ok(())
}

#[tokio::test]
async fn search_basic() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 3).await?;

    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "30").await?;

    send(&mut imap, "31 SEARCH SUBJECT \"message 2\"\r\n").await?;
    let read = read_until(&mut imap, "31 OK").await?;
    assert!(read.contains("* SEARCH 2\r\n"));

    send(&mut imap, "32 SEARCH OR SUBJECT \"message 1\" SUBJECT \"message 3\"\r\n").await?;
    let read = read_until(&mut imap, "32 OK").await?;
    assert!(read.contains("* SEARCH 1 3\r\n"));

    send(&mut imap, "33 UID SEARCH ALL\r\n").await?;
    let read = read_until(&mut imap, "33 OK").await?;
    assert!(read.contains("* SEARCH 1 2 3\r\n"));

    send(&mut imap, "34 SEARCH UNSEEN NOT SUBJECT \"message 3\"\r\n").await?;
    let read = read_until(&mut imap, "34 OK").await?;
    assert!(read.contains("* SEARCH 1 2\r\n"));
    Ok(())
}

#[tokio::test]
async fn mailbox_management_and_list() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;

    send(&mut imap, "40 CREATE Archive\r\n").await?;
    read_until(&mut imap, "40 OK").await?;
    send(&mut imap, "41 CREATE Archive\r\n").await?;
    read_until(&mut imap, "41 NO").await?;
    send(&mut imap, "42 CREATE Projects/rust\r\n").await?;
    read_until(&mut imap, "42 OK").await?;

    send(&mut imap, "43 LIST \"\" \"*\"\r\n").await?;
    let read = read_until(&mut imap, "43 OK").await?;
    assert!(read.contains("* LIST (\\Archive) \"/\" Archive"));
    assert!(read.contains("* LIST () \"/\" INBOX"));
    assert!(read.contains("* LIST (\\Noselect) \"/\" Projects\r\n"));
    assert!(read.contains("* LIST () \"/\" \"Projects/rust\""));

    // % does not cross the hierarchy delimiter
    send(&mut imap, "44 LIST \"\" \"%\"\r\n").await?;
    let read = read_until(&mut imap, "44 OK").await?;
    assert!(!read.contains("Projects/rust"));

    send(&mut imap, "45 RENAME Archive Stash\r\n").await?;
    read_until(&mut imap, "45 OK").await?;
    send(&mut imap, "46 DELETE Stash\r\n").await?;
    read_until(&mut imap, "46 OK").await?;
    send(&mut imap, "47 DELETE INBOX\r\n").await?;
    read_until(&mut imap, "47 NO").await?;

    send(&mut imap, "48 LSUB \"\" \"*\"\r\n").await?;
    let read = read_until(&mut imap, "48 OK").await?;
    assert!(read.contains("* LSUB "));

    send(&mut imap, "49 SUBSCRIBE INBOX\r\n").await?;
    read_until(&mut imap, "49 OK").await?;
    Ok(())
}

#[tokio::test]
async fn status_with_utf7_mailbox_name() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;

    // Taipei in Modified UTF-7
    send(&mut imap, "50 CREATE &U,BTFw-\r\n").await?;
    read_until(&mut imap, "50 OK").await?;
    srv.store
        .deliver("alice", "\u{53f0}\u{5317}", &email("nihao", "x"))
        .await?;

    send(&mut imap, "51 STATUS &U,BTFw- (MESSAGES UIDNEXT)\r\n").await?;
    let read = read_until(&mut imap, "51 OK").await?;
    assert!(
        read.contains("* STATUS \"&U,BTFw-\" (MESSAGES 1 UIDNEXT 2)"),
        "got {}",
        read
    );

    // INBOX is case-insensitive
    send(&mut imap, "52 STATUS iNbOx (MESSAGES)\r\n").await?;
    let read = read_until(&mut imap, "52 OK").await?;
    assert!(read.contains("* STATUS INBOX (MESSAGES 0)"));
    Ok(())
}

#[tokio::test]
async fn append_with_literal_continuation() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;

    let message = email("appended", "by hand");
    send(
        &mut imap,
        &format!("60 APPEND INBOX (\\Seen) {{{}}}\r\n", message.len()),
    )
    .await?;
    read_until(&mut imap, "+ Ready").await?;
    send(&mut imap, std::str::from_utf8(&message)?).await?;
    send(&mut imap, "\r\n").await?;
    let read = read_until(&mut imap, "60 OK").await?;
    assert!(read.contains("[APPENDUID 1 1]"), "got {}", read);

    select_inbox(&mut imap, "61").await?;
    send(&mut imap, "62 FETCH 1 FLAGS\r\n").await?;
    let read = read_until(&mut imap, "62 OK").await?;
    assert!(read.contains("FLAGS (\\Seen)"));
    Ok(())
}

#[tokio::test]
async fn close_expunges_silently() -> Result<()> {
    let srv = start_server().await?;
    deliver_n(&srv, 2).await?;
    let mut imap = connect(&srv).await?;
    login(&mut imap).await?;
    select_inbox(&mut imap, "70").await?;

    send(&mut imap, "71 STORE 1:2 +FLAGS.SILENT (\\Deleted)\r\n").await?;
    read_until(&mut imap, "71 OK").await?;
    send(&mut imap, "72 CLOSE\r\n").await?;
    let read = read_until(&mut imap, "72 OK").await?;
    assert!(!read.contains("EXPUNGE"));

    let read = select_inbox(&mut imap, "73").await?;
    assert!(read.contains("* 0 EXISTS"));
    Ok(())
}

#[tokio::test]
async fn parse_errors_keep_session_alive() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;

    send(&mut imap, "x1 FROBNICATE\r\n").await?;
    let read = read_until(&mut imap, "x1 BAD").await?;
    assert!(read.contains("unknown command"));

    send(&mut imap, "x2 LOGIN \"unterminated\r\n").await?;
    read_until(&mut imap, "x2 BAD").await?;

    send(&mut imap, "x3 NOOP\r\n").await?;
    read_until(&mut imap, "x3 OK").await?;
    Ok(())
}

#[tokio::test]
async fn id_exchange() -> Result<()> {
    let srv = start_server().await?;
    let mut imap = connect(&srv).await?;
    send(&mut imap, "i1 ID (\"name\" \"TestClient\" \"version\" NIL)\r\n").await?;
    let read = read_until(&mut imap, "i1 OK").await?;
    assert!(read.contains("* ID (\"name\" \"postillon\""));
    Ok(())
}
